//! Run-time-facing pieces of the link layer: service requests, the stubs
//! that raise them, sync points, diagnostics and the resolver handshake.
pub mod fixup;
pub mod resolver;
pub mod ring_buffer;
pub mod service_request;
pub mod stubs;

pub use fixup::{Fixup, FixupMap, FixupTable};
pub use resolver::{CallResolution, DestinationResolver, Resolution, ServiceRequestHandler};
pub use ring_buffer::{EventRing, RingEvent, RingEventKind};
pub use service_request::{
    BindCallReq, BindJumpReq, RequestArena, RequestId, ServiceRequest, ServiceRequestKind,
};
pub use stubs::{EPHEMERAL_STUB_SIZE, FreeStubList};
