pub mod config;
pub mod dataset;
pub mod rpn_nn;

/// pretty_env_logger at info level, unless RUST_LOG says otherwise
pub fn init_logging() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.filter_level(log::LevelFilter::Info),
    };
    // a logger may already be set in tests
    let _ = builder.try_init();
}
