// Process configuration: optional `config/default` file, then ARBITREX__* env overrides

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ax_data::{
    BinanceProvider, CsvDataProvider, DataProvider, PaginationConfig, PriceNormalizer, SampleDataProvider, SeriesCache,
};
use ax_report::{ChartConfig, MAX_CHART_DIMENSION};
use ax_script::SandboxLimits;
use ax_types::{config_error, AxResult};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "ARBITREX";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub data: DataConfig,
    pub sandbox: SandboxConfig,
    pub simulation: SimulationConfig,
    pub chart: ChartConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("arbitrex").join("arbitrex.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Binance,
    Csv,
    Sample,
    /// Only previously imported prices are available.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub provider: ProviderKind,
    pub binance_base_url: String,
    pub quote_asset: String,
    pub page_delay_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub csv_directory: Option<PathBuf>,
    /// Normalized series kept in memory per worker. Zero disables the cache.
    pub cache_entries: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Binance,
            binance_base_url: "https://api.binance.us".to_string(),
            quote_asset: "USDT".to_string(),
            page_delay_ms: 500,
            retry_delay_ms: 5000,
            max_retries: 5,
            csv_directory: None,
            cache_entries: 256,
        }
    }
}

impl DataConfig {
    /// The configured upstream provider, or `None` when runs may only use
    /// imported prices.
    pub fn provider(&self) -> AxResult<Option<Arc<dyn DataProvider>>> {
        let provider: Arc<dyn DataProvider> = match self.provider {
            ProviderKind::None => return Ok(None),
            ProviderKind::Sample => Arc::new(SampleDataProvider::new()),
            ProviderKind::Csv => {
                let directory = self
                    .csv_directory
                    .as_ref()
                    .ok_or_else(|| config_error!("data.csv_directory is required for the csv provider"))?;
                Arc::new(CsvDataProvider::new(directory))
            }
            ProviderKind::Binance => {
                let url = format!("{}/api/v3/klines", self.binance_base_url.trim_end_matches('/'));
                let pagination = PaginationConfig {
                    page_delay: Duration::from_millis(self.page_delay_ms),
                    retry_delay: Duration::from_millis(self.retry_delay_ms),
                    max_retries: self.max_retries,
                    ..PaginationConfig::default()
                };
                Arc::new(
                    BinanceProvider::with_url(&url)
                        .with_quote_asset(&self.quote_asset)
                        .with_pagination(pagination),
                )
            }
        };
        Ok(Some(provider))
    }

    pub fn normalizer(&self) -> AxResult<Option<PriceNormalizer>> {
        let Some(provider) = self.provider()? else {
            return Ok(None);
        };
        let normalizer = PriceNormalizer::new(provider);
        if self.cache_entries == 0 {
            return Ok(Some(normalizer));
        }
        Ok(Some(normalizer.with_cache(Arc::new(SeriesCache::with_limit(self.cache_entries)))))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_operations: u64,
    pub max_call_depth: usize,
    /// Zero disables the wall-clock limit.
    pub time_limit_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = SandboxLimits::default();
        Self {
            max_operations: limits.max_operations,
            max_call_depth: limits.max_call_depth,
            time_limit_secs: limits.time_limit.map(|d| d.as_secs()).unwrap_or(0),
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            max_operations: self.max_operations,
            max_call_depth: self.max_call_depth,
            time_limit: (self.time_limit_secs > 0).then(|| Duration::from_secs(self.time_limit_secs)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub initial_cash: Decimal,
    pub sizer_percent: Decimal,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::from(10_000),
            sizer_percent: Decimal::from(95),
        }
    }
}

impl AppConfig {
    /// Load `config/default.*` when present, then apply `ARBITREX__SECTION__KEY`
    /// environment overrides. Callers load `.env` beforehand if they want it.
    pub fn load() -> AxResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        Self::build(builder)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml(document: &str) -> AxResult<Self> {
        Self::build(Config::builder().add_source(File::from_str(document, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> AxResult<Self> {
        let config = builder
            .build()
            .map_err(|err| config_error!("failed to read configuration: {}", err))?;
        let app: AppConfig = config
            .try_deserialize()
            .map_err(|err| config_error!("invalid configuration: {}", err))?;
        app.validate()?;
        Ok(app)
    }

    fn validate(&self) -> AxResult<()> {
        if self.simulation.initial_cash <= Decimal::ZERO {
            return Err(config_error!("simulation.initial_cash must be positive"));
        }
        if self.simulation.sizer_percent <= Decimal::ZERO || self.simulation.sizer_percent > Decimal::from(100) {
            return Err(config_error!("simulation.sizer_percent must be in (0, 100]"));
        }
        if self.chart.width == 0 || self.chart.height == 0 {
            return Err(config_error!("chart.width and chart.height must be positive"));
        }
        if self.chart.width > MAX_CHART_DIMENSION || self.chart.height > MAX_CHART_DIMENSION {
            return Err(config_error!(
                "chart.width and chart.height must not exceed {} pixels",
                MAX_CHART_DIMENSION
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_types::AxError;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.data.provider, ProviderKind::Binance);
        assert_eq!(config.data.quote_asset, "USDT");
        assert_eq!(config.data.page_delay_ms, 500);
        assert_eq!(config.data.retry_delay_ms, 5000);
        assert_eq!(config.data.max_retries, 5);
        assert_eq!(config.simulation.initial_cash, Decimal::from(10_000));
        assert_eq!(config.simulation.sizer_percent, Decimal::from(95));
        assert!(config.database.path.ends_with("arbitrex/arbitrex.db"));
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            path = "/tmp/arbitrex-test.db"

            [data]
            provider = "sample"

            [sandbox]
            max_operations = 1000
            time_limit_secs = 0

            [chart]
            width = 640
            "#,
        )
        .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/arbitrex-test.db"));
        assert_eq!(config.data.provider, ProviderKind::Sample);
        assert_eq!(config.data.max_retries, 5);
        assert_eq!(config.sandbox.limits().max_operations, 1000);
        assert_eq!(config.sandbox.limits().time_limit, None);
        assert_eq!(config.chart.width, 640);
        assert_eq!(config.chart.height, ChartConfig::default().height);
        assert!(config.data.normalizer().unwrap().is_some());
    }

    #[test]
    fn test_provider_selection() {
        let mut data = DataConfig {
            provider: ProviderKind::None,
            ..DataConfig::default()
        };
        assert!(data.provider().unwrap().is_none());

        data.provider = ProviderKind::Csv;
        assert!(matches!(data.provider(), Err(AxError::Config(_))));

        data.csv_directory = Some(PathBuf::from("/data/prices"));
        assert_eq!(data.provider().unwrap().unwrap().name(), "CSV Provider");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_toml("[simulation]\ninitial_cash = 0").is_err());
        assert!(AppConfig::from_toml("[data]\nprovider = \"ftp\"").is_err());
    }

    #[test]
    fn test_chart_dimensions_are_bounded() {
        assert!(matches!(AppConfig::from_toml("[chart]\nwidth = 100000"), Err(AxError::Config(_))));
        assert!(matches!(AppConfig::from_toml("[chart]\nheight = 4294967295"), Err(AxError::Config(_))));
        assert!(AppConfig::from_toml("[chart]\nwidth = 0").is_err());

        let edge = AppConfig::from_toml("[chart]\nwidth = 8192\nheight = 8192").unwrap();
        assert_eq!(edge.chart.width, MAX_CHART_DIMENSION);
    }

    #[test]
    fn test_normalizer_cache_knob() {
        let config = AppConfig::from_toml("[data]\nprovider = \"sample\"").unwrap();
        assert_eq!(config.data.cache_entries, 256);
        let normalizer = config.data.normalizer().unwrap().unwrap();
        assert!(normalizer.cache().is_some());

        let config = AppConfig::from_toml("[data]\nprovider = \"sample\"\ncache_entries = 0").unwrap();
        assert!(config.data.normalizer().unwrap().unwrap().cache().is_none());
    }

    #[tokio::test]
    async fn test_configured_normalizer_serves_repeat_fetches_from_cache() {
        let config = AppConfig::from_toml("[data]\nprovider = \"sample\"\ncache_entries = 4").unwrap();
        let normalizer = config.data.normalizer().unwrap().unwrap();
        let day = chrono::NaiveDate::from_ymd_opt(2024, 1, 1);

        let first = normalizer.fetch("BTC", "1d", day, day).await.unwrap();
        let second = normalizer.fetch("BTC", "1d", day, day).await.unwrap();
        assert_eq!(first.len(), second.len());

        let stats = normalizer.cache().unwrap().get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
