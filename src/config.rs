use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;

use crate::db::default_db_path;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub dashboard: DashboardConfig,
    pub charging: ChargingConfig,
    pub abrp: AbrpConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Empty means the platform data directory
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub title: String,
    pub vin: String,
    pub timezone: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChargingConfig {
    pub default_price_per_kwh: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AbrpConfig {
    pub enabled_vins: Vec<String>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            title: "My car info".to_string(),
            vin: String::new(),
            timezone: String::new(),
        }
    }
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            default_price_per_kwh: 0.15,
        }
    }
}

thread_local! {
    static TEST_CONFIG_PATH: RefCell<Option<PathBuf>> = const { RefCell::new(None) };
}

#[cfg(test)]
pub fn set_test_config_path(path: PathBuf) {
    TEST_CONFIG_PATH.with(|p| *p.borrow_mut() = Some(path));
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        #[cfg(test)]
        {
            if let Some(path) = TEST_CONFIG_PATH.with(|p| p.borrow().clone()) {
                return Ok(path);
            }
        }

        Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".tripboard.toml"))
    }

    pub fn load() -> Result<Option<Config>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Some(config))
    }

    pub fn save(&self, silent: bool) -> Result<()> {
        let config_path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content).context("Failed to write config file")?;

        if !silent {
            println!("✅ Configuration saved to: {}", config_path.display());
        }

        Ok(())
    }

    /// Database location, with `~/` expanded.
    pub fn database_path(&self) -> Result<PathBuf> {
        let path = self.database.path.trim();
        if path.is_empty() {
            return default_db_path();
        }
        match path.strip_prefix("~/") {
            Some(rest) => Ok(dirs::home_dir()
                .context("Could not find home directory")?
                .join(rest)),
            None => Ok(PathBuf::from(path)),
        }
    }

    pub fn set_default_price(&mut self, price: f64) -> Result<()> {
        if !price.is_finite() || price < 0.0 {
            anyhow::bail!("Invalid price {price}: expected a non-negative number");
        }
        self.charging.default_price_per_kwh = price;
        Ok(())
    }

    pub fn set_abrp_vins(&mut self, vins: Vec<String>) {
        self.abrp.enabled_vins = vins;
    }
}

// CLI helper functions
pub fn create_default_config(overwrite: bool) -> Result<()> {
    let config = Config::default();
    if !std::fs::exists(Config::config_path()?)? || overwrite {
        config.save(true)?;

        println!("📝 Created default configuration file.");
        println!("📍 Point it at your database with:");
        println!("   tripboard config set database-path ...");
        println!("or");
        println!("   {}", Config::config_path()?.display());
    } else {
        println!("Configuration already exists.  Pass `--overwrite` to overwrite.");
    }

    Ok(())
}

pub fn show_config() -> Result<()> {
    match Config::load()? {
        Some(config) => {
            let or_default = |value: &str, fallback: &'static str| {
                if value.is_empty() {
                    fallback.to_string()
                } else {
                    value.to_string()
                }
            };
            println!("🔧 Current configuration:");
            println!(
                "   Database: {}",
                or_default(&config.database.path, "(data directory)")
            );
            println!("   Title: {}", config.dashboard.title);
            println!("   Vehicle: {}", or_default(&config.dashboard.vin, "(first)"));
            println!(
                "   Timezone: {}",
                or_default(&config.dashboard.timezone, "(system)")
            );
            println!(
                "   Default price: {} per kWh",
                config.charging.default_price_per_kwh
            );
            println!("   ABRP vehicles: {}", config.abrp.enabled_vins.join(", "));
        }
        None => {
            println!("❌ No configuration file found.");
            println!("   Run 'tripboard config init' to create one.");
        }
    }
    Ok(())
}

pub fn set_config_value(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?.unwrap_or_default();

    match key {
        "database-path" => config.database.path = value.to_string(),
        "title" => config.dashboard.title = value.to_string(),
        "vin" => config.dashboard.vin = value.trim().to_string(),
        "timezone" => {
            let value = value.trim();
            if !value.is_empty() {
                value
                    .parse::<chrono_tz::Tz>()
                    .map_err(|e| anyhow::anyhow!("Invalid timezone {value:?}: {e}"))?;
            }
            config.dashboard.timezone = value.to_string();
        }
        "default-price" => {
            let price = value.parse::<f64>().context("Invalid number value")?;
            config.set_default_price(price)?;
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }

    config.save(false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_config() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let config_path = dir.path().join(".tripboard.toml");
        set_test_config_path(config_path.clone());
        (dir, config_path)
    }

    #[test]
    fn default_config_round_trip() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        let loaded = Config::load()
            .expect("load config")
            .expect("config should exist");

        assert_eq!(loaded.dashboard.title, "My car info");
        assert_eq!(loaded.dashboard.vin, "");
        assert_eq!(loaded.charging.default_price_per_kwh, 0.15);
        assert!(loaded.abrp.enabled_vins.is_empty());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let (_dir, path) = setup_test_config();
        fs::write(&path, "[dashboard]\nvin = \"VF3\"\n").expect("write");

        let cfg = Config::load().expect("load").expect("config");
        assert_eq!(cfg.dashboard.vin, "VF3");
        assert_eq!(cfg.dashboard.title, "My car info");
        assert_eq!(cfg.charging.default_price_per_kwh, 0.15);
    }

    #[test]
    fn database_path_expands_home() {
        let mut cfg = Config::default();
        cfg.database.path = "/srv/car/info.db".to_string();
        assert_eq!(
            cfg.database_path().expect("path"),
            PathBuf::from("/srv/car/info.db")
        );

        cfg.database.path = "~/car/info.db".to_string();
        let expanded = cfg.database_path().expect("path");
        assert!(expanded.ends_with("car/info.db"));
        assert!(!expanded.starts_with("~"));
    }

    #[test]
    fn set_config_value_behaviour() {
        let (_dir, _path) = setup_test_config();
        create_default_config(true).expect("create_default_config");

        set_config_value("database-path", "/tmp/info.db").expect("set database-path");
        set_config_value("title", "Van").expect("set title");
        set_config_value("vin", " VF3 ").expect("set vin");
        set_config_value("timezone", "Europe/Paris").expect("set timezone");
        set_config_value("default-price", "0.2").expect("set default-price");

        let cfg = Config::load()
            .expect("load config")
            .expect("config should exist");

        assert_eq!(cfg.database.path, "/tmp/info.db");
        assert_eq!(cfg.dashboard.title, "Van");
        assert_eq!(cfg.dashboard.vin, "VF3");
        assert_eq!(cfg.dashboard.timezone, "Europe/Paris");
        assert_eq!(cfg.charging.default_price_per_kwh, 0.2);

        let err = set_config_value("unknown-key", "value").unwrap_err();
        let msg = format!("{err}");
        assert!(
            msg.contains("Unknown config key"),
            "unexpected error message: {msg}"
        );
        let err = set_config_value("default-price", "-1").unwrap_err();
        assert!(format!("{err}").contains("Invalid price"));
        let err = set_config_value("timezone", "Mars/Olympus").unwrap_err();
        assert!(format!("{err}").contains("Invalid timezone"));
    }
}
