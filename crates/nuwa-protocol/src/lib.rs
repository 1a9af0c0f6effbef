//! nuwa relay protocol
//!
//! Newline-delimited JSON frames exchanged between a relay server and its
//! clients. Each line is one object.
//!
//! ## Requests
//! ```text
//! {"op":"get","id":1,"key":"/artifacts/app/public/data/globalSession"}
//! {"op":"set","id":2,"key":"...","value":{...}}
//! {"op":"watch","id":3,"key":"..."}
//! {"op":"ping","id":4}
//! ```
//!
//! ## Responses
//! ```text
//! {"kind":"ok","id":2}
//! {"kind":"document","id":1,"key":"...","exists":true,"value":{...}}
//! {"kind":"pong","id":4}
//! {"kind":"error","id":1,"code":"BAD_REQUEST","message":"..."}
//! {"kind":"changed","key":"...","value":{...}}
//! ```
//!
//! `changed` frames are pushed unsolicited for every write to a watched key.

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{encode, LineCodec, MAX_FRAME_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{ErrorCode, Request, Response};
