pub const PROFILE_ENV: &str = "MAOLAN_DUPLEX_PROFILE";
pub const DEBUG_ENV: &str = "MAOLAN_DUPLEX_DEBUG";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| flag_value(&v))
        .unwrap_or(false)
}

fn flag_value(v: &str) -> bool {
    let s = v.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "yes" || s == "on"
}
