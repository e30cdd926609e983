//! Multi-device submission: validation and fan-out.
//!
//! Shared by the HTTP PUT handler and the WS `send` frame.  Validation runs
//! before any insert so a conflicting submission leaves no partial state.

use courier_protocol::{
    Envelope, EnvelopeKind, IncomingMessage, IncomingMessageList, MismatchedDevices, StaleDevices,
};
use std::collections::HashSet;
use uuid::Uuid;

use crate::repo::accounts::DeviceRecord;
use crate::repo;
use crate::sender::SendError;
use crate::state::AppState;

#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted,
    Mismatched(MismatchedDevices),
    Stale(StaleDevices),
    UnknownDestination,
}

/// Validate and dispatch one submission.  `source` is the authenticated
/// sender; sealed-sender messages shed it per envelope.
pub async fn submit_messages(
    state: &AppState,
    source: Option<(Uuid, u32)>,
    destination: Uuid,
    list: &IncomingMessageList,
) -> Result<SubmitOutcome, SendError> {
    let devices = repo::accounts::list_devices(&state.pool, destination).await?;
    if devices.is_empty() {
        return Ok(SubmitOutcome::UnknownDestination);
    }

    // A device syncing to its own account does not message itself.
    let excluded_device = match source {
        Some((account, device)) if account == destination => Some(device),
        _ => None,
    };

    if let Some(mismatched) = device_mismatch(&devices, &list.messages, excluded_device) {
        return Ok(SubmitOutcome::Mismatched(mismatched));
    }
    if let Some(stale) = stale_devices(&devices, &list.messages) {
        return Ok(SubmitOutcome::Stale(stale));
    }

    for message in &list.messages {
        let envelope = envelope_for(destination, source, list, message);
        state.sender.send(envelope, list.online).await?;
    }
    Ok(SubmitOutcome::Accepted)
}

/// Compare the submitted device set against the account's devices.
pub fn device_mismatch(
    devices: &[DeviceRecord],
    messages: &[IncomingMessage],
    excluded_device: Option<u32>,
) -> Option<MismatchedDevices> {
    let expected: HashSet<u32> = devices
        .iter()
        .map(|d| d.device_id)
        .filter(|id| Some(*id) != excluded_device)
        .collect();
    let submitted: HashSet<u32> = messages.iter().map(|m| m.destination_device).collect();

    let mut missing_devices: Vec<u32> = expected.difference(&submitted).copied().collect();
    let mut extra_devices: Vec<u32> = submitted.difference(&expected).copied().collect();
    if missing_devices.is_empty() && extra_devices.is_empty() {
        return None;
    }
    missing_devices.sort_unstable();
    extra_devices.sort_unstable();
    Some(MismatchedDevices {
        missing_devices,
        extra_devices,
    })
}

/// Registration-id check: a mismatch means the client's view of the device
/// is stale.
pub fn stale_devices(
    devices: &[DeviceRecord],
    messages: &[IncomingMessage],
) -> Option<StaleDevices> {
    let mut stale: Vec<u32> = Vec::new();
    for message in messages {
        let record = devices
            .iter()
            .find(|d| d.device_id == message.destination_device);
        if let Some(record) = record {
            if record.registration_id != message.destination_registration_id {
                stale.push(message.destination_device);
            }
        }
    }
    if stale.is_empty() {
        return None;
    }
    stale.sort_unstable();
    stale.dedup();
    Some(StaleDevices {
        stale_devices: stale,
    })
}

fn envelope_for(
    destination: Uuid,
    source: Option<(Uuid, u32)>,
    list: &IncomingMessageList,
    message: &IncomingMessage,
) -> Envelope {
    let sealed = message.kind == EnvelopeKind::UnidentifiedSender;
    let source = if sealed { None } else { source };
    Envelope {
        guid: Uuid::nil(),
        server_timestamp: 0,
        client_timestamp: list.timestamp,
        kind: message.kind,
        source_uuid: source.map(|(account, _)| account),
        source_device: source.map(|(_, device)| device),
        destination_uuid: destination,
        destination_device: message.destination_device,
        content: message.content.clone(),
    }
}
