//! Domain types for daily kline acquisition

pub mod bar;
pub mod calendar;
pub mod symbol;
pub mod window;

pub use bar::{coerce_f64, BarRecord};
pub use calendar::{
    default_end_date, format_yyyymmdd, normalize_date_text, parse_yyyymmdd, DateError,
    TradingCalendar, WeekdayCalendar,
};
pub use symbol::{Market, SymbolDescriptor, SymbolError};
pub use window::{FetchWindow, WindowError};
