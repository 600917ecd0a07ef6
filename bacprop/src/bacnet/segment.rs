//! Segmented-transfer bookkeeping (ASHRAE 135 clause 5.4).
//!
//! The gateway only ever *transmits* large APDUs (ReadPropertyMultiple
//! responses), so the transmit side carries the full window/ack/retry state
//! machine; the receive side is a plain reassembly buffer that acks each
//! arriving request segment.

use std::time::{Duration, Instant};

use super::apdu::{Apdu, abort_reason};
use super::npdu::NetworkAddress;

/// Per BACnet defaults: segment timeout 2 s, APDU retry timeout 3 s.
pub const SEGMENT_TIMEOUT: Duration = Duration::from_secs(2);
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(3);
pub const MAX_RETRIES: u32 = 3;

/// Window size proposed to peers.
const PROPOSED_WINDOW: u8 = 8;

/// Upper bound on segments per response; beyond this the transfer is refused.
const MAX_TX_SEGMENTS: usize = 128;

/// Cap on reassembled request size from a single peer.
const MAX_RX_BYTES: usize = 1 << 20;

/// Octets of ComplexAck header preceding service data in a segment.
const SEGMENT_HEADER_OCTETS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TransferKey {
    peer: NetworkAddress,
    invoke_id: u8,
}

#[derive(Debug)]
struct OutboundTransfer {
    key: TransferKey,
    service_choice: u8,
    segments: Vec<Vec<u8>>,
    /// First segment not yet acknowledged.
    base: usize,
    /// Window granted by the peer's last SegmentAck.
    window: u8,
    last_activity: Instant,
    retries: u32,
}

impl OutboundTransfer {
    fn segment_apdu(&self, index: usize) -> Apdu {
        Apdu::ComplexAck {
            segmented: true,
            more_follows: index + 1 < self.segments.len(),
            invoke_id: self.key.invoke_id,
            sequence_number: Some((index % 256) as u8),
            proposed_window_size: Some(PROPOSED_WINDOW),
            service_choice: self.service_choice,
            service_data: self.segments[index].clone(),
        }
    }

    fn current_window(&self) -> Vec<Apdu> {
        let end = (self.base + self.window as usize).min(self.segments.len());
        (self.base..end).map(|i| self.segment_apdu(i)).collect()
    }
}

#[derive(Debug)]
struct InboundTransfer {
    key: TransferKey,
    header: Apdu,
    data: Vec<u8>,
    next_sequence: u8,
    last_activity: Instant,
}

/// APDUs the segmenter wants delivered to a peer.
#[derive(Debug, PartialEq)]
pub struct SegmentOutput {
    pub peer: NetworkAddress,
    pub apdu: Apdu,
}

/// Segmentation state for one device application.
#[derive(Debug, Default)]
pub struct Segmenter {
    outbound: Vec<OutboundTransfer>,
    inbound: Vec<InboundTransfer>,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a segmented response, returning the first window of segments.
    ///
    /// `max_apdu` and `segment_limit` come from the peer's request header.
    /// Returns an Abort APDU instead when the response cannot be carried.
    pub fn start_response(
        &mut self,
        peer: NetworkAddress,
        invoke_id: u8,
        service_choice: u8,
        service_data: Vec<u8>,
        max_apdu: usize,
        segment_limit: Option<usize>,
        now: Instant,
    ) -> Vec<SegmentOutput> {
        let chunk = max_apdu.saturating_sub(SEGMENT_HEADER_OCTETS).max(1);
        let segments: Vec<Vec<u8>> = service_data.chunks(chunk).map(<[u8]>::to_vec).collect();
        if segments.len() > MAX_TX_SEGMENTS
            || segment_limit.is_some_and(|limit| segments.len() > limit)
        {
            return vec![SegmentOutput {
                peer,
                apdu: Apdu::Abort {
                    server: true,
                    invoke_id,
                    abort_reason: abort_reason::BUFFER_OVERFLOW,
                },
            }];
        }

        let key = TransferKey {
            peer: peer.clone(),
            invoke_id,
        };
        self.outbound.retain(|transfer| transfer.key != key);
        let transfer = OutboundTransfer {
            key,
            service_choice,
            segments,
            base: 0,
            window: 1, // single segment until the peer grants a window
            last_activity: now,
            retries: 0,
        };
        let window = transfer.current_window();
        self.outbound.push(transfer);
        window
            .into_iter()
            .map(|apdu| SegmentOutput {
                peer: peer.clone(),
                apdu,
            })
            .collect()
    }

    /// Process a SegmentAck from a peer, returning the next window.
    pub fn handle_segment_ack(
        &mut self,
        peer: &NetworkAddress,
        invoke_id: u8,
        sequence_number: u8,
        negative: bool,
        actual_window_size: u8,
        now: Instant,
    ) -> Vec<SegmentOutput> {
        let Some(position) = self
            .outbound
            .iter()
            .position(|t| t.key.peer == *peer && t.key.invoke_id == invoke_id)
        else {
            return Vec::new();
        };
        let transfer = &mut self.outbound[position];
        transfer.last_activity = now;
        transfer.window = actual_window_size.max(1).min(PROPOSED_WINDOW);

        if !negative {
            // Acked everything up to and including `sequence_number`.
            let acked = sequence_number as usize;
            if acked + 1 > transfer.base {
                transfer.base = acked + 1;
                transfer.retries = 0;
            }
            if transfer.base >= transfer.segments.len() {
                self.outbound.swap_remove(position);
                return Vec::new();
            }
        } else {
            // Peer missed a segment; retransmit from the one after its ack.
            transfer.base = (sequence_number as usize + 1).min(transfer.segments.len());
        }

        let transfer = &self.outbound[position];
        transfer
            .current_window()
            .into_iter()
            .map(|apdu| SegmentOutput {
                peer: peer.clone(),
                apdu,
            })
            .collect()
    }

    /// Drop any transfer the peer aborted.
    pub fn handle_abort(&mut self, peer: &NetworkAddress, invoke_id: u8) {
        self.outbound
            .retain(|t| !(t.key.peer == *peer && t.key.invoke_id == invoke_id));
        self.inbound
            .retain(|t| !(t.key.peer == *peer && t.key.invoke_id == invoke_id));
    }

    /// Retransmit stalled windows; abort transfers that exhausted retries.
    pub fn sweep(&mut self, now: Instant) -> Vec<SegmentOutput> {
        let mut outputs = Vec::new();
        self.outbound.retain_mut(|transfer| {
            if now.duration_since(transfer.last_activity) < SEGMENT_TIMEOUT {
                return true;
            }
            if transfer.retries >= MAX_RETRIES {
                outputs.push(SegmentOutput {
                    peer: transfer.key.peer.clone(),
                    apdu: Apdu::Abort {
                        server: true,
                        invoke_id: transfer.key.invoke_id,
                        abort_reason: abort_reason::OTHER,
                    },
                });
                return false;
            }
            transfer.retries += 1;
            transfer.last_activity = now;
            for apdu in transfer.current_window() {
                outputs.push(SegmentOutput {
                    peer: transfer.key.peer.clone(),
                    apdu,
                });
            }
            true
        });
        self.inbound
            .retain(|t| now.duration_since(t.last_activity) < RETRY_TIMEOUT);
        outputs
    }

    /// Accept one segment of an inbound confirmed request.
    ///
    /// Returns the SegmentAck to send, plus the reassembled request once the
    /// final segment arrives.
    pub fn accept_request_segment(
        &mut self,
        peer: &NetworkAddress,
        apdu: &Apdu,
        now: Instant,
    ) -> (Vec<SegmentOutput>, Option<(u8, u8, Vec<u8>)>) {
        let Apdu::ConfirmedRequest {
            more_follows,
            invoke_id,
            sequence_number,
            service_choice,
            service_data,
            ..
        } = apdu
        else {
            return (Vec::new(), None);
        };
        let sequence = sequence_number.unwrap_or(0);

        let position = self
            .inbound
            .iter()
            .position(|t| t.key.peer == *peer && t.key.invoke_id == *invoke_id);
        let transfer = match position {
            Some(position) => &mut self.inbound[position],
            None => {
                if sequence != 0 {
                    // Lost the start of the transfer; nothing to ack against.
                    return (Vec::new(), None);
                }
                self.inbound.push(InboundTransfer {
                    key: TransferKey {
                        peer: peer.clone(),
                        invoke_id: *invoke_id,
                    },
                    header: apdu.clone(),
                    data: Vec::new(),
                    next_sequence: 0,
                    last_activity: now,
                });
                let last = self.inbound.len() - 1;
                &mut self.inbound[last]
            }
        };

        let duplicate = sequence != transfer.next_sequence;
        if !duplicate && transfer.data.len() + service_data.len() <= MAX_RX_BYTES {
            transfer.data.extend_from_slice(service_data);
            transfer.next_sequence = transfer.next_sequence.wrapping_add(1);
        }
        transfer.last_activity = now;

        let ack = SegmentOutput {
            peer: peer.clone(),
            apdu: Apdu::SegmentAck {
                negative: duplicate,
                server: true,
                invoke_id: *invoke_id,
                sequence_number: transfer.next_sequence.wrapping_sub(1),
                actual_window_size: 1,
            },
        };

        if !*more_follows && !duplicate {
            let Apdu::ConfirmedRequest { service_choice: choice, .. } = &transfer.header else {
                unreachable!("inbound transfers always start from a confirmed request");
            };
            debug_assert_eq!(choice, service_choice);
            let complete = (
                *invoke_id,
                *service_choice,
                std::mem::take(&mut transfer.data),
            );
            self.inbound
                .retain(|t| !(t.key.peer == *peer && t.key.invoke_id == *invoke_id));
            (vec![ack], Some(complete))
        } else {
            (vec![ack], None)
        }
    }

    #[cfg(test)]
    fn outbound_len(&self) -> usize {
        self.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> NetworkAddress {
        NetworkAddress::new(0, vec![10, 0, 0, 5, 0xBA, 0xC0])
    }

    fn service_data_of(output: &SegmentOutput) -> &[u8] {
        match &output.apdu {
            Apdu::ComplexAck { service_data, .. } => service_data,
            other => panic!("expected ComplexAck, got {other:?}"),
        }
    }

    #[test]
    fn response_splits_at_negotiated_size() {
        let mut segmenter = Segmenter::new();
        let now = Instant::now();
        let data = vec![0xAB; 120];
        let outputs =
            segmenter.start_response(peer(), 7, 14, data, 55, None, now);
        // chunk = 50; first window holds one segment until the peer widens it
        assert_eq!(outputs.len(), 1);
        assert_eq!(service_data_of(&outputs[0]).len(), 50);
        match &outputs[0].apdu {
            Apdu::ComplexAck {
                segmented,
                more_follows,
                sequence_number,
                ..
            } => {
                assert!(*segmented);
                assert!(*more_follows);
                assert_eq!(*sequence_number, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn acks_advance_the_window_to_completion() {
        let mut segmenter = Segmenter::new();
        let now = Instant::now();
        segmenter.start_response(peer(), 7, 14, vec![0xCD; 120], 55, None, now);

        let outputs = segmenter.handle_segment_ack(&peer(), 7, 0, false, 4, now);
        assert_eq!(outputs.len(), 2); // segments 1 and 2 remain
        match &outputs[1].apdu {
            Apdu::ComplexAck { more_follows, .. } => assert!(!*more_follows),
            other => panic!("unexpected {other:?}"),
        }

        let outputs = segmenter.handle_segment_ack(&peer(), 7, 2, false, 4, now);
        assert!(outputs.is_empty());
        assert_eq!(segmenter.outbound_len(), 0);
    }

    #[test]
    fn negative_ack_rewinds() {
        let mut segmenter = Segmenter::new();
        let now = Instant::now();
        segmenter.start_response(peer(), 7, 14, vec![0xEF; 120], 55, None, now);
        segmenter.handle_segment_ack(&peer(), 7, 0, false, 4, now);

        let outputs = segmenter.handle_segment_ack(&peer(), 7, 0, true, 4, now);
        match &outputs[0].apdu {
            Apdu::ComplexAck { sequence_number, .. } => assert_eq!(*sequence_number, Some(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stalled_transfer_retries_then_aborts() {
        let mut segmenter = Segmenter::new();
        let start = Instant::now();
        segmenter.start_response(peer(), 7, 14, vec![0x11; 120], 55, None, start);

        let mut now = start;
        for _ in 0..MAX_RETRIES {
            now += SEGMENT_TIMEOUT + Duration::from_millis(10);
            let outputs = segmenter.sweep(now);
            assert!(matches!(outputs[0].apdu, Apdu::ComplexAck { .. }));
        }
        now += SEGMENT_TIMEOUT + Duration::from_millis(10);
        let outputs = segmenter.sweep(now);
        assert!(matches!(
            outputs[0].apdu,
            Apdu::Abort {
                abort_reason: abort_reason::OTHER,
                ..
            }
        ));
        assert_eq!(segmenter.outbound_len(), 0);
    }

    #[test]
    fn oversized_response_is_refused() {
        let mut segmenter = Segmenter::new();
        let outputs = segmenter.start_response(
            peer(),
            9,
            14,
            vec![0x22; 400],
            55,
            Some(2),
            Instant::now(),
        );
        assert!(matches!(
            outputs[0].apdu,
            Apdu::Abort {
                abort_reason: abort_reason::BUFFER_OVERFLOW,
                ..
            }
        ));
    }

    #[test]
    fn request_segments_reassemble() {
        let mut segmenter = Segmenter::new();
        let now = Instant::now();
        let first = Apdu::ConfirmedRequest {
            segmented: true,
            more_follows: true,
            segmented_response_accepted: true,
            max_segments: crate::bacnet::apdu::MaxSegments::Unspecified,
            max_response_size: crate::bacnet::apdu::MaxApduSize::Up1024,
            invoke_id: 5,
            sequence_number: Some(0),
            proposed_window_size: Some(1),
            service_choice: 14,
            service_data: vec![1, 2],
        };
        let (acks, complete) = segmenter.accept_request_segment(&peer(), &first, now);
        assert_eq!(acks.len(), 1);
        assert!(complete.is_none());

        let second = Apdu::ConfirmedRequest {
            segmented: true,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: crate::bacnet::apdu::MaxSegments::Unspecified,
            max_response_size: crate::bacnet::apdu::MaxApduSize::Up1024,
            invoke_id: 5,
            sequence_number: Some(1),
            proposed_window_size: Some(1),
            service_choice: 14,
            service_data: vec![3, 4],
        };
        let (acks, complete) = segmenter.accept_request_segment(&peer(), &second, now);
        assert_eq!(acks.len(), 1);
        let (invoke_id, service_choice, data) = complete.unwrap();
        assert_eq!(invoke_id, 5);
        assert_eq!(service_choice, 14);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }
}
