use super::*;

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            base_url: "http://homeassistant.local:8123".to_string(),
            access_token: String::new(),
            request_timeout_secs: 10,
            automatic_control_entity: Some("input_select.automatic_control_mode".to_string()),
            min_dispatch_price_entity: None,
        }
    }
}

impl Default for AmberConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.amber.com.au/v1".to_string(),
            access_token: String::new(),
            site_id: String::new(),
            forecast_intervals: 24,
            resolution_minutes: 30,
            rate_limit_default_wait_secs: 300,
            max_rate_limit_retries: 3,
            price_interval_secs: 300,
            real_price_offset_secs: 20,
            estimate_retry_secs: 10,
        }
    }
}

impl Default for PlantEntities {
    fn default() -> Self {
        Self {
            rated_capacity: "sensor.sigen_plant_rated_energy_capacity".to_string(),
            backup_soc: "number.sigen_plant_ess_backup_state_of_charge".to_string(),
            discharge_capacity: "sensor.sigen_plant_available_max_discharging_capacity"
                .to_string(),
            charge_capacity: "sensor.sigen_plant_available_max_charging_capacity".to_string(),
            battery_power: "sensor.reversed_battery_power".to_string(),
            pv_power: "sensor.sigen_plant_pv_power".to_string(),
            load_power: "sensor.sigen_plant_consumed_power".to_string(),
            grid_export_power: "sensor.sigen_plant_grid_export_power".to_string(),
            solar_forecast_remaining: "sensor.solcast_pv_forecast_forecast_remaining_today"
                .to_string(),
            daily_load_consumption: "sensor.sigen_plant_daily_load_consumption".to_string(),
            control_mode: "select.sigen_plant_remote_ems_control_mode".to_string(),
            discharge_limit: "number.sigen_plant_ess_max_discharging_limit".to_string(),
            charge_limit: "number.sigen_plant_ess_max_charging_limit".to_string(),
            pv_limit: "number.sigen_plant_pv_max_power_limit".to_string(),
            export_limit: "number.sigen_plant_grid_export_limitation".to_string(),
            import_limit: "number.sigen_plant_grid_import_limitation".to_string(),
        }
    }
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            max_discharge_power_kw: 21.0,
            max_charge_power_kw: 21.0,
            max_pv_power_kw: 21.0,
            max_export_power_kw: 21.0,
            max_import_power_kw: 21.0,
            entities: PlantEntities::default(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            bucket_minutes: 5,
            history_days: 7,
            refresh_interval_hours: 24,
            reset_epsilon_kwh: 0.05,
            cutoff_time: "06:00".to_string(),
            buffer_kwh: 5.0,
        }
    }
}

impl Default for BaseLoadConfig {
    fn default() -> Self {
        Self {
            percentile: 20.0,
            window_days: 7,
            ttl_hours: 24,
        }
    }
}

impl Default for SolarExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            margin_kwh: 20.0,
            min_price: 2.0,
        }
    }
}

impl Default for EffectivePriceConfig {
    fn default() -> Self {
        Self {
            solar_horizon_time: "18:00".to_string(),
            solar_reserve_kwh: 10.0,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            good_sell_price: 50.0,
            sanity_ceiling: 1000.0,
            minimal_energy_floor_kwh: 5.0,
            target_price_reduction_percent: 80.0,
            minimum_dispatch_price: 10.0,
            solar_export: SolarExportConfig::default(),
            effective_price: EffectivePriceConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: "mobile_app_phone".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entity_prefix: "sensor.gridwise".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/gridwise.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_assistant: HomeAssistantConfig::default(),
            amber: AmberConfig::default(),
            plant: PlantConfig::default(),
            profile: ProfileConfig::default(),
            base_load: BaseLoadConfig::default(),
            dispatch: DispatchConfig::default(),
            notifications: NotificationConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            poll_interval_ms: 2000,
            error_backoff_secs: 30,
            timezone: "Australia/Brisbane".to_string(),
        }
    }
}
