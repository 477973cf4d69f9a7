pub mod acquisition;
pub mod cancel;
pub mod exchange;
pub mod fps;
pub mod status;

pub use acquisition::{AcquisitionLoop, AcquisitionOutcome, AcquisitionState};
pub use cancel::CancelToken;
pub use exchange::{ClaimedFrame, ExchangeStats, FrameExchange, FrameProducer};
pub use fps::FpsMeter;
pub use status::{StatusPoller, StatusSample};
