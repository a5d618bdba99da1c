//! Configuration loading: a TOML file, found by searching a list of
//! well-known directories, layered under command-line overrides
//! (spec §6 "Configuration (enumerated)").

use refill_api::Error;
use serde_derive::Deserialize;
use std::env;
use std::time::Duration;
use tracing::Level;

fn def_log_level() -> String {
    String::from("warn")
}

fn def_nozzle_id() -> String {
    String::from("0076")
}

fn def_serial_baud() -> u32 {
    460_800
}

fn def_secs_5() -> f64 {
    5.0
}

fn def_rfid_total_budget() -> f64 {
    180.0
}

fn def_drf_submit_timeout() -> f64 {
    120.0
}

fn def_nozzle_heartbeat_budget() -> f64 {
    40.0
}

fn def_app_comm_active_budget() -> f64 {
    600.0
}

fn def_app_inform_timeout() -> f64 {
    10.0
}

fn def_meter_stability_count() -> usize {
    2
}

fn def_meter_stability_window() -> f64 {
    5.0
}

fn def_persist_step_liters() -> f64 {
    1.0
}

fn def_max_rfid_retries() -> u32 {
    100
}

fn def_tick_interval() -> f64 {
    1.0
}

fn def_http_bind() -> String {
    String::from("0.0.0.0:3030")
}

fn def_store_path() -> String {
    String::from("./refill-transactions.json")
}

fn def_uploads_dir() -> String {
    String::from("./uploads")
}

#[derive(Deserialize, Clone)]
pub struct SerialConfig {
    pub path: String,
    #[serde(default = "def_serial_baud")]
    pub baud: u32,
}

#[derive(Deserialize, Clone)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "def_http_bind")]
    pub bind: String,
    pub shared_secret: String,
    #[serde(default = "def_uploads_dir")]
    pub uploads_dir: String,
}

#[derive(Deserialize, Clone)]
pub struct Limits {
    #[serde(default = "def_secs_5")]
    pub uart_response_timeout_secs: f64,
    #[serde(default = "def_secs_5")]
    pub rfid_retry_interval_secs: f64,
    #[serde(default = "def_rfid_total_budget")]
    pub rfid_total_budget_secs: f64,
    #[serde(default = "def_drf_submit_timeout")]
    pub drf_submit_timeout_secs: f64,
    #[serde(default = "def_nozzle_heartbeat_budget")]
    pub nozzle_heartbeat_budget_secs: f64,
    #[serde(default = "def_app_comm_active_budget")]
    pub app_comm_active_budget_secs: f64,
    #[serde(default = "def_app_inform_timeout")]
    pub app_inform_timeout_secs: f64,
    #[serde(default = "def_secs_5")]
    pub meter_read_timeout_secs: f64,
    #[serde(default = "def_meter_stability_count")]
    pub meter_stability_count: usize,
    #[serde(default = "def_meter_stability_window")]
    pub meter_stability_window_secs: f64,
    #[serde(default = "def_secs_5")]
    pub meter_stability_duration_secs: f64,
    #[serde(default = "def_persist_step_liters")]
    pub persist_step_liters: f64,
    #[serde(default = "def_max_rfid_retries")]
    pub max_rfid_retries: u32,
    #[serde(default = "def_tick_interval")]
    pub tick_interval_secs: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            uart_response_timeout_secs: def_secs_5(),
            rfid_retry_interval_secs: def_secs_5(),
            rfid_total_budget_secs: def_rfid_total_budget(),
            drf_submit_timeout_secs: def_drf_submit_timeout(),
            nozzle_heartbeat_budget_secs: def_nozzle_heartbeat_budget(),
            app_comm_active_budget_secs: def_app_comm_active_budget(),
            app_inform_timeout_secs: def_app_inform_timeout(),
            meter_read_timeout_secs: def_secs_5(),
            meter_stability_count: def_meter_stability_count(),
            meter_stability_window_secs: def_meter_stability_window(),
            meter_stability_duration_secs: def_secs_5(),
            persist_step_liters: def_persist_step_liters(),
            max_rfid_retries: def_max_rfid_retries(),
            tick_interval_secs: def_tick_interval(),
        }
    }
}

macro_rules! secs {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) -> Duration {
            Duration::from_secs_f64(self.$field)
        }
    };
}

impl Limits {
    secs!(uart_response_timeout, uart_response_timeout_secs);
    secs!(rfid_retry_interval, rfid_retry_interval_secs);
    secs!(rfid_total_budget, rfid_total_budget_secs);
    secs!(drf_submit_timeout, drf_submit_timeout_secs);
    secs!(nozzle_heartbeat_budget, nozzle_heartbeat_budget_secs);
    secs!(app_comm_active_budget, app_comm_active_budget_secs);
    secs!(app_inform_timeout, app_inform_timeout_secs);
    secs!(meter_read_timeout, meter_read_timeout_secs);
    secs!(meter_stability_window, meter_stability_window_secs);
    secs!(meter_stability_duration, meter_stability_duration_secs);
    secs!(tick_interval, tick_interval_secs);
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,
    #[serde(default = "def_nozzle_id")]
    pub nozzle_id: String,
    pub tank_id: u64,
    pub serial: SerialConfig,
    pub directory: DirectoryConfig,
    pub http: HttpConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default = "def_store_path")]
    pub store_path: String,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }
}

fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    let matches = Command::new("refilld")
        .version(crate_version!())
        .about("Supervises a single automated fuel refill nozzle.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    (matches.get_flag("print_cfg"), cfg)
}

fn parse_config(contents: &str) -> Result<Config, Error> {
    toml::from_str(contents).map_err(|e| Error::ConfigError(format!("{}", e)))
}

async fn from_file(path: &str) -> Option<Result<Config, Error>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);

        Some(parse_config(&contents))
    } else {
        None
    }
}

async fn find_cfg() -> Result<Config, Error> {
    const CFG_FILE: &str = "refilld.toml";

    let mut dirs = vec![String::from("./")];

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home))
    }

    dirs.push(String::from("/usr/local/etc/"));
    dirs.push(String::from("/etc/"));

    for dir in dirs {
        let file = format!("{}{}", &dir, CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }

    Err(Error::ConfigError(String::from(
        "no refilld.toml found -- 'serial', 'directory', 'http', and 'tank_id' are required",
    )))
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}", cfg.get_log_level());
    println!("    nozzle id: {}", cfg.nozzle_id);
    println!("    tank id: {}", cfg.tank_id);
    println!("    serial: {} @ {}", cfg.serial.path, cfg.serial.baud);
    println!("    directory: {}", cfg.directory.base_url);
    println!("    http bind: {}", cfg.http.bind);
    println!("    store path: {}", cfg.store_path);
}

#[tracing::instrument(name = "loading config")]
pub async fn get() -> Option<Config> {
    match find_cfg().await {
        Ok(cfg) => {
            let (print_cfg, cfg) = from_cmdline(cfg);

            if print_cfg {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            println!("{}", e);
            None
        }
    }
}
