//! Caller-id and message-waiting spills.
//!
//! A spill is the modulated sample stream written to a station port between
//! rings. The message framing (SDMF/MDMF) is built here; modulation is left
//! to the line interface. A spill is consumed positionally: each write takes
//! the next chunk and the spill is dropped when exhausted.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::types::CallerInfo;

const SDMF_CALLER_ID: u8 = 0x04;
const MDMF_CALLER_ID: u8 = 0x80;
const MDMF_MESSAGE_WAITING: u8 = 0x82;
const PARAM_DATE_TIME: u8 = 0x01;
const PARAM_NUMBER: u8 = 0x02;
const PARAM_NUMBER_ABSENT: u8 = 0x04;
const PARAM_NAME: u8 = 0x07;
const PARAM_NAME_ABSENT: u8 = 0x08;
const PARAM_VISUAL_INDICATOR: u8 = 0x0B;

/// Absence reason marker: private
const ABSENT_PRIVATE: u8 = b'P';
/// Absence reason marker: out of area
const ABSENT_UNAVAILABLE: u8 = b'O';

fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

fn date_stamp(now: NaiveDateTime) -> String {
    format!(
        "{:02}{:02}{:02}{:02}",
        now.month(),
        now.day(),
        now.hour(),
        now.minute()
    )
}

/// Build a single data message format caller-id message
pub fn sdmf_message(caller: &CallerInfo, hidden: bool, now: NaiveDateTime) -> Bytes {
    let mut payload = BytesMut::new();
    payload.put_slice(date_stamp(now).as_bytes());
    match (&caller.number, hidden) {
        (_, true) => payload.put_u8(ABSENT_PRIVATE),
        (Some(number), false) => payload.put_slice(number.as_bytes()),
        (None, false) => payload.put_u8(ABSENT_UNAVAILABLE),
    }

    let mut msg = BytesMut::with_capacity(payload.len() + 3);
    msg.put_u8(SDMF_CALLER_ID);
    msg.put_u8(payload.len() as u8);
    msg.put_slice(&payload);
    let sum = checksum(&msg);
    msg.put_u8(sum);
    msg.freeze()
}

fn put_param(buf: &mut BytesMut, kind: u8, value: &[u8]) {
    buf.put_u8(kind);
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
}

/// Build a multiple data message format caller-id message
pub fn mdmf_message(caller: &CallerInfo, hidden: bool, now: NaiveDateTime) -> Bytes {
    let mut params = BytesMut::new();
    put_param(&mut params, PARAM_DATE_TIME, date_stamp(now).as_bytes());
    match (&caller.number, hidden) {
        (_, true) => put_param(&mut params, PARAM_NUMBER_ABSENT, &[ABSENT_PRIVATE]),
        (Some(number), false) => put_param(&mut params, PARAM_NUMBER, number.as_bytes()),
        (None, false) => put_param(&mut params, PARAM_NUMBER_ABSENT, &[ABSENT_UNAVAILABLE]),
    }
    match (&caller.name, hidden) {
        (_, true) => put_param(&mut params, PARAM_NAME_ABSENT, &[ABSENT_PRIVATE]),
        (Some(name), false) => put_param(&mut params, PARAM_NAME, name.as_bytes()),
        (None, false) => put_param(&mut params, PARAM_NAME_ABSENT, &[ABSENT_UNAVAILABLE]),
    }
    framed(MDMF_CALLER_ID, &params)
}

/// Build a message-waiting indicator message
pub fn mwi_message(waiting: bool) -> Bytes {
    let mut params = BytesMut::new();
    put_param(&mut params, PARAM_VISUAL_INDICATOR, &[if waiting { 0xFF } else { 0x00 }]);
    framed(MDMF_MESSAGE_WAITING, &params)
}

fn framed(kind: u8, params: &[u8]) -> Bytes {
    let mut msg = BytesMut::with_capacity(params.len() + 3);
    msg.put_u8(kind);
    msg.put_u8(params.len() as u8);
    msg.put_slice(params);
    let sum = checksum(&msg);
    msg.put_u8(sum);
    msg.freeze()
}

/// What a spill announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillKind {
    CallerId,
    MessageWaiting,
}

/// A modulated spill being written to a line
#[derive(Debug, Clone)]
pub struct CallerIdSpill {
    kind: SpillKind,
    data: Bytes,
    position: usize,
    /// Ring count after which the spill is sent; `0` sends while idle
    rings_required: u32,
}

impl CallerIdSpill {
    pub fn new(kind: SpillKind, data: Bytes, rings_required: u32) -> Self {
        Self {
            kind,
            data,
            position: 0,
            rings_required,
        }
    }

    pub fn kind(&self) -> SpillKind {
        self.kind
    }

    pub fn rings_required(&self) -> u32 {
        self.rings_required
    }

    /// Bytes not yet written
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.position..]
    }

    /// Record that `written` bytes went out; true once the spill is complete
    pub fn advance(&mut self, written: usize) -> bool {
        self.position = (self.position + written).min(self.data.len());
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.position >= self.data.len()
    }

    /// Whether the spill may be sent after `rings` completed ring cycles
    pub fn window(&self, rings: u32) -> SpillWindow {
        match rings.cmp(&self.rings_required) {
            std::cmp::Ordering::Less => SpillWindow::Early,
            std::cmp::Ordering::Equal => SpillWindow::Open,
            std::cmp::Ordering::Greater => SpillWindow::Missed,
        }
    }
}

/// Relation between the ring count and a spill's delivery window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillWindow {
    Early,
    Open,
    /// The window passed; the spill must be discarded
    Missed,
}
