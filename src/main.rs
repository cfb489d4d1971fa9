pub mod models {
    pub mod backend;
    pub mod homeassistant;
    pub mod profile;
}

pub mod client;
pub mod config;
pub mod coordinator;
pub mod envfile;
pub mod handler;
pub mod history;
pub mod homeassistant;
pub mod services {
    pub mod auth;
    pub mod device;
    pub mod location;
    pub mod thermostat;
}

use crate::client::{BackendClient, Transport};
use crate::config::{BackendConfig, Config};
use crate::coordinator::{Coordinator, CoordinatorSettings};
use crate::handler::{BackendUpdateHandler, HandlerSettings};
use crate::homeassistant::HomeAssistantClient;
use crate::models::profile::LambdaArgs;
use log::{error, info, warn};

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    let backend_cfg = BackendConfig::from_file(&cfg.backend_config_path)?;
    info!(
        "Config loaded (climate={}, power={}, external_temp={}, interval={}s, history_days={}, max_upload={}, backend={})",
        cfg.climate_entity_id,
        cfg.heat_pump_power_entity_id.as_deref().unwrap_or("-"),
        cfg.external_temp_entity_id.as_deref().unwrap_or("-"),
        cfg.update_interval.as_secs(),
        cfg.history_days,
        cfg.max_upload_history_readings,
        backend_cfg.backend.base_url
    );

    // 2) Home Assistant
    let ha = HomeAssistantClient::new(&cfg.ha_base_url, &cfg.ha_token);
    let (unit, ha_version) = ha
        .temperature_unit()
        .map_err(|e| format!("Home Assistant at {} unreachable: {}", cfg.ha_base_url, e))?;
    info!("Connected to Home Assistant {} (temperatures in {})", ha_version, unit.symbol());

    // 3) Backend session
    let backend = BackendClient::new(Transport::new(backend_cfg), &cfg.user_hash, cfg.address.clone());
    let thermostat = backend
        .get_thermostat_info()
        .map_err(|e| format!("OptiSpark backend login failed: {}", e))?;
    info!(
        "Authenticated to OptiSpark backend (thermostat {}, {} at {:.1} C)",
        thermostat.id,
        thermostat.hvac_mode.as_str(),
        thermostat.target_temp_high
    );
    match backend.get_predictions() {
        Ok(predictions) => match predictions.first() {
            Some(next) => info!(
                "Backend forecast: {} slot(s), next {} {} at {:.1} C",
                predictions.len(),
                next.date,
                next.mode,
                next.set_point
            ),
            None => info!("Backend forecast is empty"),
        },
        Err(e) if e.is_authentication() => return Err(format!("OptiSpark backend rejected credentials: {}", e)),
        Err(e) => warn!("Backend forecast unavailable: {}", e),
    }

    // 4) Request payload seeded from the thermostat
    let postcode = Some(cfg.address.postcode.clone());
    let mut args = LambdaArgs::new(&cfg.user_hash, postcode, cfg.address.address.clone(), cfg.address.city.clone());
    args.set_point = thermostat.target_temp_high;
    args.home_assistant_version = ha_version;

    let handler = BackendUpdateHandler::new(
        &backend,
        &ha,
        HandlerSettings {
            user_hash: cfg.user_hash.clone(),
            climate_entity_id: cfg.climate_entity_id.clone(),
            heat_pump_power_entity_id: cfg.heat_pump_power_entity_id.clone(),
            external_temp_entity_id: cfg.external_temp_entity_id.clone(),
            postcode: args.postcode.clone(),
            tariff: cfg.tariff.clone(),
            history_days: cfg.history_days,
            history_lookback_days: cfg.history_lookback_days,
            max_upload_history_readings: cfg.max_upload_history_readings,
            temperature_unit: unit,
        },
    );

    // 5) Control loop (steady cadence)
    let settings = CoordinatorSettings {
        climate_entity_id: cfg.climate_entity_id.clone(),
        heat_pump_power_entity_id: cfg.heat_pump_power_entity_id.clone(),
        enable_switch_entity_id: cfg.enable_switch_entity_id.clone(),
        set_point_entity_id: cfg.set_point_entity_id.clone(),
        interval: cfg.update_interval,
    };
    let mut coordinator = Coordinator::new(&backend, &ha, handler, settings, unit, args);
    coordinator.run_loop()
}

fn main() {
    let loaded_env = match envfile::load_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "optispark-bridge {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
