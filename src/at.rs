//! AT-command plumbing: transport, response parsing and URC routing.
//!
//! The physical layer is abstracted away by the [`uart::Tx`] and [`uart::Rx`]
//! traits. Everything above them is plain byte accumulation: a command is
//! written, the reply is collected until a terminator, and any unsolicited
//! result codes interleaved with the reply are preserved for the demux in
//! [`urc`].

pub mod response;
pub mod uart;
pub mod urc;
