//! Frame production and delivery.
//!
//! | Module        | Responsibility                                    |
//! |---------------|---------------------------------------------------|
//! | `types`       | Viewport, raw and encoded frames                  |
//! | `render`      | Renderer seam (`RenderHandle`, `RenderLauncher`)  |
//! | `encoder`     | Quality-aware frame compression                   |
//! | `bandwidth`   | Rolling throughput estimate                       |
//! | `quality`     | Tier policy and per-session controller            |
//! | `pipeline`    | Per-session capture → encode → deliver loop       |
//! | `fanout`      | Subscriber sets, backpressure, terminal sealing   |
//! | `transport`   | Non-blocking push seam to connections             |
//! | `input`       | Validated input relay                             |

pub mod bandwidth;
pub mod encoder;
pub mod fanout;
pub mod input;
pub mod pipeline;
pub mod quality;
pub mod render;
pub mod transport;
pub mod types;

pub use bandwidth::BandwidthMonitor;
pub use encoder::{FrameEncoder, ZstdEncoder};
pub use fanout::{DeliveryFanout, SubscriberSet};
pub use input::{InputEvent, InputLimits, InputRelay};
pub use pipeline::{CapturePipeline, PipelineExit};
pub use quality::{QualityConfig, QualityController, QualityMode, QualityParams, Tier, TierPolicy};
pub use render::{RenderHandle, RenderLauncher, RenderSlot};
pub use transport::{ChannelTransport, Transport};
pub use types::{EncodedFrame, PixelFormat, RawFrame, Viewport};
