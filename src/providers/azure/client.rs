mod builds;
mod core;

pub use self::core::AzureClient;
