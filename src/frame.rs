//! Discord IPC frame carrying a `SET_ACTIVITY` with a null activity.
//!
//! Written straight onto a live bridge connection to wipe the rich presence
//! left behind by a remote application. The reply frame is never read.

use serde::Serialize;

/// Opcode written in the second header word. Only this frame kind is ever built.
pub const OPCODE_FRAME: i32 = 1;

#[derive(Serialize)]
struct SetActivity<'a> {
    cmd: &'static str,
    args: SetActivityArgs,
    nonce: &'a str,
}

#[derive(Serialize)]
struct SetActivityArgs {
    pid: u32,
    activity: Option<()>,
}

/// Build the presence-clear frame.
///
/// Layout: `i32le(payload_len) ++ i32le(OPCODE_FRAME) ++ json`, where the JSON
/// body is `{"cmd":"SET_ACTIVITY","args":{"pid":<pid>,"activity":null},"nonce":<nonce>}`.
pub fn clear_activity_frame(pid: u32, nonce: &str) -> Vec<u8> {
    let body = SetActivity {
        cmd: "SET_ACTIVITY",
        args: SetActivityArgs {
            pid,
            activity: None,
        },
        nonce,
    };
    // Plain structs of strings and integers always serialize.
    let payload = serde_json::to_vec(&body).unwrap_or_default();
    let len = i32::try_from(payload.len()).unwrap_or(i32::MAX);

    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&OPCODE_FRAME.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Traceability token for a clear sent on `channel`. Never validated by Discord.
pub fn clear_nonce(channel: crate::protocol::ChannelId) -> String {
    format!("clear-channel-{channel}-{}", crate::util::now_ms())
}
