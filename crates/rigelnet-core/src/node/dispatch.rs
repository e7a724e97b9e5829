//! Handler dispatch for delivered payloads.

use super::config::UnknownHandlerPolicy;
use super::NodeInterface;
use crate::error::HandlerError;
use crate::handler::{HandlerId, HandlerRegistry};
use crate::packet::Packet;

/// A payload the peer should not have sent; the connection is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProtocolViolation(pub String);

/// Run every `(HandlerId, args)` message in `packet` against `node`.
///
/// Dispatch stops early if `still_open` reports that a handler closed the
/// connection the payload arrived on. Malformed messages discard the rest of
/// the payload; unknown IDs and illegal messages are returned as violations
/// unless the policy says to ignore them.
pub(crate) fn run_handlers<N, F>(
    node: &mut N,
    registry: &HandlerRegistry,
    packet: &mut Packet,
    policy: UnknownHandlerPolicy,
    still_open: F,
) -> Result<(), ProtocolViolation>
where
    N: NodeInterface,
    F: Fn(&N) -> bool,
{
    while !packet.end_of_packet() {
        let id: HandlerId = match packet.extract_or_err() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    "Truncated handler ID ({}); discarding {} trailing bytes",
                    e,
                    packet.remaining_data_size()
                );
                return Ok(());
            }
        };

        let (Some(handler), Some(name)) = (registry.handler_with_id(id), registry.name_with_id(id)) else {
            return match policy {
                UnknownHandlerPolicy::Disconnect => {
                    Err(ProtocolViolation(format!("Unknown handler ID {id}")))
                }
                UnknownHandlerPolicy::Ignore => {
                    tracing::warn!(
                        "Unknown handler ID {}; discarding {} trailing bytes",
                        id,
                        packet.remaining_data_size()
                    );
                    Ok(())
                }
            };
        };

        tracing::trace!("Dispatching '{}' ({} bytes left)", name, packet.remaining_data_size());
        let result = {
            let target: &mut dyn NodeInterface = &mut *node;
            handler(target, packet)
        };
        match result {
            Ok(()) if packet.is_valid() => {}
            Ok(()) => {
                tracing::warn!("Handler '{}' read past its arguments; discarding the rest of the payload", name);
                return Ok(());
            }
            Err(HandlerError::Packet(e)) => {
                tracing::warn!("Handler '{}' failed to read its arguments: {}", name, e);
                return Ok(());
            }
            Err(HandlerError::Illegal(reason)) => {
                return Err(ProtocolViolation(format!("Illegal '{name}' message: {reason}")));
            }
        }

        if !still_open(node) {
            tracing::debug!("Connection closed by handler '{}'; dropping the rest of the payload", name);
            return Ok(());
        }
    }
    Ok(())
}
