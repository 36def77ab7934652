use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use quota_policyd::daemon;
use quota_policyd::server::{self, Mode, PolicyServer};
use quota_policyd::stats::UsageReport;
use quota_policyd::{AttributeParser, Config, DecisionEngine, PolicyStore};
use std::fs::OpenOptions;
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("quota-policyd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Postfix policy service enforcing per-tenant hourly and daily send quotas")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (YAML, or TOML by .toml extension)")
                .default_value(Config::default_path()),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .value_name("MODE")
                .help("auto (spawn unless stdin is a terminal), spawn (one request on stdin/stdout) or listen (unix socket)")
                .value_parser(["auto", "spawn", "listen"])
                .default_value("auto"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file and exit")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate configuration and database schema, then exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-request")
                .long("test-request")
                .value_name("FILE")
                .help("Evaluate one attribute block from FILE without recording anything")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show per-tenant quota usage")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-format")
                .long("stats-format")
                .value_name("FORMAT")
                .value_parser(["text", "json"])
                .default_value("text")
                .help("Output format for --stats"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run the listener in the background")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(Config::default_path());
    let (config, from_file) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = init_logging(&config, log_level) {
        eprintln!("Error opening log file: {e:#}");
        process::exit(1);
    }
    if !from_file {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    // Check everything that can fail before any fork. The handles opened
    // here are closed again; the engine opens its own.
    if let Err(e) = check_startup(&config) {
        log::error!("Startup failed: {e:#}");
        eprintln!("Startup failed: {e:#}");
        process::exit(1);
    }

    if matches.get_flag("test-config") {
        println!("Configuration OK");
        println!("  Socket:   {} ({:o})", config.socket_path, config.socket_mode);
        println!("  Database: {}", config.database_path);
        println!("  Timezone: {}", config.timezone);
        println!(
            "  Default limits: {}/hour, {}/day",
            config.limits.default_hourly, config.limits.default_daily
        );
        return;
    }

    if let Some(request_file) = matches.get_one::<String>("test-request") {
        test_request_file(&open_engine(&config), request_file);
        return;
    }

    if matches.get_flag("stats") {
        show_stats(
            &open_engine(&config),
            matches.get_one::<String>("stats-format").map(String::as_str),
        );
        return;
    }

    let mode = matches
        .get_one::<String>("mode")
        .and_then(|m| m.parse::<Mode>().ok())
        .unwrap_or(Mode::Auto)
        .resolve();

    let exit_code = match mode {
        Mode::Spawn => run_spawn(open_engine(&config)),
        _ => run_listener(&config, matches.get_flag("daemon")),
    };
    process::exit(exit_code);
}

fn load_config(path: &str) -> anyhow::Result<(Config, bool)> {
    if Path::new(path).exists() {
        Ok((Config::from_file(path)?, true))
    } else {
        Ok((Config::default(), false))
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn init_logging(config: &Config, level: LevelFilter) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);

    if let Some(log_file) = &config.log_file {
        let file = OpenOptions::new().create(true).append(true).open(log_file)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn check_startup(config: &Config) -> anyhow::Result<()> {
    config.timezone()?;
    PolicyStore::check(&config.database_path, &config.store)
}

fn open_engine(config: &Config) -> Arc<DecisionEngine> {
    match DecisionEngine::from_config(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            log::error!("Startup failed: {e:#}");
            eprintln!("Startup failed: {e:#}");
            process::exit(1);
        }
    }
}

fn run_spawn(engine: Arc<DecisionEngine>) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {e}");
            return 1;
        }
    };

    runtime.block_on(async {
        if let Err(e) = server::serve_once(tokio::io::stdin(), tokio::io::stdout(), engine).await {
            // The MTA went away; nothing left to answer.
            log::debug!("Spawn-mode exchange ended early: {e}");
        }
    });
    0
}

fn run_listener(config: &Config, daemon_mode: bool) -> i32 {
    if !config.timezone().is_ok_and(|tz| tz.is_monotonic()) {
        log::warn!(
            "timezone '{}' follows daylight saving time; the hourly window can over-count \
             during the repeated hour. A fixed offset such as \"+03:00\" avoids this.",
            config.timezone
        );
    }

    if daemon_mode {
        if let Err(e) = daemon::daemonize(&config.pid_file) {
            log::error!("Failed to daemonize: {e:#}");
            return 1;
        }
    }

    // Opened only now so no SQLite handle crosses the fork.
    let engine = match DecisionEngine::from_config(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            log::error!("Startup failed: {e:#}");
            if daemon_mode {
                daemon::remove_pid_file(&config.pid_file);
            }
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {e}");
            return 1;
        }
    };

    let server = PolicyServer::new(engine, &config.socket_path, config.socket_mode);
    let result = runtime.block_on(server.run(shutdown_signal()));

    if daemon_mode {
        daemon::remove_pid_file(&config.pid_file);
    }

    match result {
        Ok(()) => 0,
        Err(e) => {
            log::error!("Policy service error: {e:#}");
            1
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn test_request_file(engine: &DecisionEngine, request_file: &str) {
    let content = match std::fs::read(request_file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading request file: {e}");
            process::exit(1);
        }
    };

    let mut parser = AttributeParser::new();
    let mut request = None;
    for line in content.split_inclusive(|b| *b == b'\n') {
        if let Some(finished) = parser.push_line(line) {
            request = Some(finished);
            break;
        }
    }
    let request = request.unwrap_or_else(|| parser.finish());

    println!("Testing request: {request_file}");
    println!("  sender:    {}", request.sender());
    println!("  recipient: {}", request.recipient());
    println!("  subject:   {}", request.subject());
    println!();

    let decision = engine.preview(&request);
    match serde_json::to_string_pretty(&decision) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error rendering decision: {e}"),
    }
    println!();
    print!("{}", decision.action().to_response());
}

fn show_stats(engine: &DecisionEngine, format: Option<&str>) {
    let report = match UsageReport::collect(engine) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Failed to collect usage: {e:#}");
            process::exit(1);
        }
    };

    match format {
        Some("json") => match report.to_json() {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Failed to render usage: {e:#}");
                process::exit(1);
            }
        },
        _ => print!("{}", report.to_text()),
    }
}
