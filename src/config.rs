use dotenvy::dotenv;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub mongo_uri: String,
    pub mongo_db: String,
    pub balance_collection: String,
    pub flush_interval_secs: u64,
}

impl Config {
    /// Loads configuration from the environment, reading a `.env` file if
    /// one is present. Every value has a default; nothing here panics.
    pub fn from_env() -> Self {
        dotenv().ok();
        Self::build()
    }

    fn build() -> Self {
        Config {
            mongo_uri: env::var("MONGO_URI")
                .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
            mongo_db: env::var("MONGO_DB").unwrap_or_else(|_| "pawbank".to_string()),
            balance_collection: env::var("BALANCE_COLLECTION")
                .unwrap_or_else(|_| "cookies".to_string()),
            flush_interval_secs: env::var("FLUSH_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),
        }
    }
}
