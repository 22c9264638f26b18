use evlog::Logger;
use once_cell::sync::OnceCell;

static LOGGER: OnceCell<Logger> = OnceCell::new();

pub fn set_logger(logger: Logger) {
    LOGGER.set(logger).unwrap_or_else(|_| panic!("logger was already initialized"));
}

pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(Logger::default)
}
