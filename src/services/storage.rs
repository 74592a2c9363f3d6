// 本地配置读取

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::models::settings::Settings;

/// 获取配置目录路径
/// macOS: ~/Library/Application Support/sshmux
/// Linux: ~/.config/sshmux
/// Windows: C:\Users\<用户名>\AppData\Roaming\sshmux
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("无法获取系统配置目录")?
        .join("sshmux"))
}

/// 获取设置文件路径
pub fn get_settings_file() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("settings.json"))
}

/// 加载设置（文件不存在时使用默认值）
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_file()?)
}

/// 从指定路径加载设置
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        debug!("[Storage] {} not found, using defaults", path.display());
        return Ok(Settings::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("无法读取设置文件 {}", path.display()))?;
    let settings: Settings = serde_json::from_str(&content)
        .with_context(|| format!("无法解析设置文件 {}", path.display()))?;
    Ok(settings)
}
