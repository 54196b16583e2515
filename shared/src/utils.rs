use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

fn device_id_regex() -> &'static Regex {
    static DEVICE_ID: OnceLock<Regex> = OnceLock::new();
    DEVICE_ID.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("device id pattern is valid"))
}

fn firmware_version_regex() -> &'static Regex {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    VERSION.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("version pattern is valid"))
}

// 验证工具函数
pub fn validate_device_id(device_id: &str) -> bool {
    device_id.len() <= 128 && device_id_regex().is_match(device_id)
}

pub fn validate_firmware_version(version: &str) -> bool {
    firmware_version_regex().is_match(version)
}

pub fn validate_firmware_url(url: &str) -> bool {
    ["http://", "https://", "ftp://"]
        .iter()
        .any(|scheme| url.starts_with(scheme) && url.len() > scheme.len())
}

// UUID 生成工具函数
pub fn generate_update_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn generate_command_id() -> String {
    format!("cmd_{}", Uuid::new_v4().simple())
}

// 时间工具函数
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

// 字符串工具函数
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
