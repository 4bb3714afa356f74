use std::path::Path;

/// Known SIP-protected prefixes. Nothing under these can be modified,
/// even as root.
pub const SIP_PATHS: &[&str] = &[
    "/System",
    "/usr",
    "/bin",
    "/sbin",
    "/var",
    "/private/var/db/SystemPolicyConfiguration",
    "/Applications/Utilities",
];

/// Home-relative locations gated behind Full Disk Access
const FDA_PATHS: &[&str] = &[
    "Library/Mail",
    "Library/Messages",
    "Library/Safari",
    "Library/Cookies",
    "Library/HomeKit",
    "Library/Containers/com.apple.",
    "Library/Group Containers/group.com.apple.",
    "Library/Metadata/CoreSpotlight",
];

/// Check if a path is SIP-protected
pub fn is_sip_protected(path: &Path) -> bool {
    SIP_PATHS.iter().any(|p| path.starts_with(p))
}

/// Check if a path likely requires Full Disk Access
pub fn requires_full_disk_access(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    FDA_PATHS.iter().any(|p| path_str.contains(p))
}

/// Get a helpful message for permission issues
pub fn permission_hint(path: &Path) -> String {
    if is_sip_protected(path) {
        "This path is protected by System Integrity Protection (SIP) and cannot be modified."
            .to_string()
    } else if requires_full_disk_access(path) {
        "This path requires Full Disk Access. Grant it in System Settings > Privacy & Security > Full Disk Access."
            .to_string()
    } else {
        format!(
            "Check file permissions for '{}'. Force mode or sudo may be needed for system paths.",
            path.display()
        )
    }
}
