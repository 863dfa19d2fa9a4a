pub mod lot;
pub mod market;
pub mod order;
pub mod signal;

pub use lot::{Lot, LotRole, LotStatus, PositionSnapshot};
pub use market::{Bar, Quote, Timeframe};
pub use order::{Fill, Order, OrderKind, OrderRequest, OrderSide, OrderStatus};
pub use signal::{GapDirection, GapEvent, Signal, SignalKind};
