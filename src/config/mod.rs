mod settings;

pub use settings::FlexConfig;
