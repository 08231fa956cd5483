//! Domain types: candles, window arithmetic, symbol names.

pub mod candle;
pub mod symbol;
pub mod window;

pub use candle::{Candle15m, Candle4h, FULL_WINDOW_COUNT};
pub use symbol::{validate_symbol, SymbolError};
pub use window::{
    is_quarter_aligned, quarter_duration, window_duration, AnchorError, WindowAnchor,
    QUARTER_MINUTES, RECORDS_PER_WINDOW, WINDOWS_PER_DAY, WINDOW_HOURS,
};
