use crate::error::Result;

/// Initializes logging for a faultline process. At levels below debug, only
/// the crate's own logs are shown.
pub fn init(level: &str) -> Result<()> {
    let level = level.parse::<simplelog::LevelFilter>()?;
    let mut config = simplelog::ConfigBuilder::new();
    if level != simplelog::LevelFilter::Debug {
        config.add_filter_allow_str("faultline");
    }
    simplelog::SimpleLogger::init(level, config.build())?;
    Ok(())
}
