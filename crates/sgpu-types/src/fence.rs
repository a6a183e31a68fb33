use serde::{Deserialize, Serialize};

/// Number of low bits in a packed fence value that hold the per-queue
/// ticket counter. The remaining high bits carry the queue tag.
pub const TICKET_BITS: u32 = 56;

const TICKET_MASK: u64 = (1 << TICKET_BITS) - 1;

/// Hardware submission channels with independent ordering.
///
/// Discriminants match the underlying API's command-list-type numbering
/// so packed fence values interop directly with driver-visible counters.
/// Value 1 is the bundle slot, which never owns a queue -- see
/// [`ListKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueueKind {
    Graphics = 0,
    Compute = 2,
    Copy = 3,
}

impl QueueKind {
    /// Every queue kind, in dense-index order.
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Copy];

    /// Number of distinct queue kinds.
    pub const COUNT: usize = 3;

    /// Tag byte packed into the high bits of a fence value.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Dense index for fixed-size per-queue arrays.
    pub const fn index(self) -> usize {
        match self {
            QueueKind::Graphics => 0,
            QueueKind::Compute => 1,
            QueueKind::Copy => 2,
        }
    }

    /// Inverse of [`QueueKind::tag`]. Returns `None` for tags that do
    /// not name a queue (including the bundle slot).
    pub const fn from_tag(tag: u8) -> Option<QueueKind> {
        match tag {
            0 => Some(QueueKind::Graphics),
            2 => Some(QueueKind::Compute),
            3 => Some(QueueKind::Copy),
            _ => None,
        }
    }
}

/// Command-list types as callers request them. A superset of
/// [`QueueKind`]: bundles are recorded but never submitted on their own
/// queue, so no routing rule exists for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ListKind {
    Graphics = 0,
    Bundle = 1,
    Compute = 2,
    Copy = 3,
}

impl ListKind {
    /// The queue that executes lists of this kind, if one exists.
    pub const fn queue(self) -> Option<QueueKind> {
        match self {
            ListKind::Graphics => Some(QueueKind::Graphics),
            ListKind::Bundle => None,
            ListKind::Compute => Some(QueueKind::Compute),
            ListKind::Copy => Some(QueueKind::Copy),
        }
    }
}

impl From<QueueKind> for ListKind {
    fn from(kind: QueueKind) -> ListKind {
        match kind {
            QueueKind::Graphics => ListKind::Graphics,
            QueueKind::Compute => ListKind::Compute,
            QueueKind::Copy => ListKind::Copy,
        }
    }
}

/// A point on one queue's submission timeline.
///
/// Tickets are per-queue counters starting at 1; ticket 0 is the
/// "nothing submitted yet" sentinel every queue's fence starts signaled
/// at. The tagged form is used everywhere inside the engine; packing to
/// a raw `u64` happens only at the device boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceValue {
    kind: QueueKind,
    ticket: u64,
}

impl FenceValue {
    pub fn new(kind: QueueKind, ticket: u64) -> FenceValue {
        debug_assert!(ticket <= TICKET_MASK, "fence ticket overflow: {ticket}");
        FenceValue { kind, ticket }
    }

    /// The sentinel value a queue's fence is created signaled at.
    pub const fn zero(kind: QueueKind) -> FenceValue {
        FenceValue { kind, ticket: 0 }
    }

    pub const fn kind(self) -> QueueKind {
        self.kind
    }

    pub const fn ticket(self) -> u64 {
        self.ticket
    }

    /// Pack into the driver-visible representation: tag in the high 8
    /// bits, ticket in the low 56.
    pub const fn to_raw(self) -> u64 {
        ((self.kind.tag() as u64) << TICKET_BITS) | self.ticket
    }

    /// Decode a packed value. Total over everything [`to_raw`] produces;
    /// rejects raw values whose tag names no queue.
    ///
    /// [`to_raw`]: FenceValue::to_raw
    pub const fn from_raw(raw: u64) -> Option<FenceValue> {
        match QueueKind::from_tag((raw >> TICKET_BITS) as u8) {
            Some(kind) => Some(FenceValue {
                kind,
                ticket: raw & TICKET_MASK,
            }),
            None => None,
        }
    }
}
