use std::sync::OnceLock;
use std::{fs, io};

use chrono::Local;
use fern::Dispatch;
use log::{Level, LevelFilter};

use crate::config::LoggerConfig;

/// Handle every task carries for logging.
///
/// Zero-sized: the real sink is the process-wide fern dispatcher installed by
/// [`init_logger`], so cloning costs nothing.
#[derive(Clone, Debug, Default)]
pub struct Logger;

impl Logger {
    pub fn debug(&self, msg: &str) {
        self.emit(Level::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.emit(Level::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.emit(Level::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.emit(Level::Error, msg);
    }

    fn emit(&self, level: Level, msg: &str) {
        log::log!(level, "{}", msg);
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// How one record is laid out on a given output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineFormat {
    /// Terminal: timestamp and name highlighted with ANSI colours
    Console,
    /// `timestamp - name - LEVEL - message`
    Plain,
    /// One JSON object per line
    Json,
}

impl LineFormat {
    fn render(self, timestamp: &str, name: &str, level: Level, message: &str) -> String {
        match self {
            LineFormat::Console => format!(
                "\x1b[92m{}\x1b[0m - \x1b[94m{}\x1b[0m - {} - {}",
                timestamp, name, level, message
            ),
            LineFormat::Plain => format!("{} - {} - {} - {}", timestamp, name, level, message),
            LineFormat::Json => serde_json::json!({
                "timestamp": timestamp,
                "name": name,
                "level": level.to_string(),
                "message": message,
            })
            .to_string(),
        }
    }
}

/// A dispatcher branch that renders every record with `format`.
fn branch(format: LineFormat, name: &str, date_format: &str) -> Dispatch {
    let name = name.to_string();
    let date_format = date_format.to_string();

    Dispatch::new().format(move |out, message, record| {
        let timestamp = Local::now().format(&date_format).to_string();
        let line = format.render(&timestamp, &name, record.level(), &message.to_string());
        out.finish(format_args!("{}", line))
    })
}

/// `<dir>/<name>.log`, with dots in `name` turned into underscores.
fn log_file_path(dir: &str, name: &str) -> String {
    let file = format!("{}.log", name.replace('.', "_"));
    if dir.is_empty() {
        file
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), file)
    }
}

/// Open the log file for appending; an unopenable file degrades to a sink.
fn file_sink(cfg: &LoggerConfig, name: &str) -> Box<dyn io::Write + Send> {
    if !cfg.log_file_path.is_empty() {
        let _ = fs::create_dir_all(&cfg.log_file_path);
    }

    let path = log_file_path(&cfg.log_file_path, name);
    match fern::log_file(&path) {
        Ok(file) => Box::new(file),
        Err(err) => {
            eprintln!("Warning: could not open log file {}: {}", path, err);
            Box::new(io::sink())
        }
    }
}

/// Install the process-wide dispatcher on first call and return a [`Logger`].
///
/// Later calls ignore their arguments. An unparsable level means `Debug`.
pub fn init_logger(name: &str, cfg: &LoggerConfig) -> Logger {
    LOGGER
        .get_or_init(|| {
            let level = cfg.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Debug);
            let mut root = Dispatch::new().level(level);

            if cfg.enable_console_log {
                root = root.chain(branch(LineFormat::Console, name, &cfg.date_format).chain(io::stdout()));
            }

            if cfg.enable_file_log {
                let format = if cfg.enable_json_log { LineFormat::Json } else { LineFormat::Plain };
                root = root.chain(branch(format, name, &cfg.date_format).chain(file_sink(cfg, name)));
            }

            // Someone else (an embedding app, another test) may own the global logger
            if let Err(err) = root.apply() {
                eprintln!("Warning: logger already initialized: {}", err);
            }

            Logger
        })
        .clone()
}
