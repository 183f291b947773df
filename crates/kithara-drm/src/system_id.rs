#![forbid(unsafe_code)]

//! Well-known DRM system ids.

const WIDEVINE: &str = "edef8ba979d64acea3c827dcd51d21ed";
const PLAYREADY: &str = "9a04f07998404286ab92e65be0885f95";
const CLEARKEY: &str = "e2719d58a985b3c9781ab030af78d30e";
const FAIRPLAY: &str = "94ce86fb07ff4f43adb893d2fa968ca2";

/// DRM system id (lowercase hex) for a key system name, if well known.
///
/// Accepts both reverse-domain names (`com.widevine.alpha`) and short
/// aliases (`widevine`).
pub fn drm_system_id(key_system: &str) -> Option<&'static str> {
    let key_system = key_system.to_ascii_lowercase();
    if key_system.contains("widevine") {
        Some(WIDEVINE)
    } else if key_system.contains("playready") {
        Some(PLAYREADY)
    } else if key_system.contains("clearkey") {
        Some(CLEARKEY)
    } else if key_system.contains("fairplay") || key_system.starts_with("com.apple.fps") {
        Some(FAIRPLAY)
    } else {
        None
    }
}
