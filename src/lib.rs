pub mod config {
    pub mod settings;
}
pub mod routes {
    pub mod health;
}
pub mod services {
    pub mod candles;
    pub mod clock;
    pub mod feed;
    pub mod market_data;
    pub mod pipeline;
    pub mod scheduler;
    pub mod tick_buffer;
    pub mod worker;

    pub mod indicators;
    pub mod strategies {
        pub mod common;
        pub use common::{Side, Signal, Strategy, StrategyKind, StrategySpec, Trigger};
        pub mod bollinger_bands;
        pub mod ema_crossover;
        pub mod engine;
        pub use engine::StrategyEngine;
        pub mod mean_reversion;
        pub mod multi_indicator;
        pub mod registry;
    }
}

pub mod utils {
    pub mod errors;
    pub mod signature;
}
