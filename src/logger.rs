use fern;
use log;

/// Sets up console logging for hosts that do not bring their own backend.
///
/// This function configures the logging system using the `fern` crate with a
/// timestamped format. Applications embedding the service usually install
/// their own dispatcher instead; calling this twice is harmless, the second
/// attempt is reported and ignored.
pub fn setup_logging(level: log::LevelFilter) {
    let init_log_result = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply();

    if let Err(e) = init_log_result {
        log::warn!(
            "Logging is already initialized, keeping the existing dispatcher: {}",
            e
        );
        return;
    }

    log::info!("-== Smart card service logging is initialized ==-");
}
