//! Transport independent key distribution sequencing
// ([Vol 3] Part H, Section 3.6.1).
//!
//! After encryption is established each side transmits the keys its
//! negotiated distribution mask names, one PDU at a time and in the order
//! the specification fixes. This module tracks which PDUs are still owed in
//! each direction; the role state machines decide when to send and what key
//! material goes into each packet.

use crate::types::{Command, KeyDistributionFlags};

const PDU_ENCRYPTION_INFORMATION: u8 = 1 << 0;
const PDU_CENTRAL_IDENTIFICATION: u8 = 1 << 1;
const PDU_IDENTITY_INFORMATION: u8 = 1 << 2;
const PDU_IDENTITY_ADDRESS_INFORMATION: u8 = 1 << 3;
const PDU_SIGNING_INFORMATION: u8 = 1 << 4;

/// Distribution order fixed by the specification.
const PDU_ORDER: [(u8, Command); 5] = [
    (PDU_ENCRYPTION_INFORMATION, Command::EncryptionInformation),
    (PDU_CENTRAL_IDENTIFICATION, Command::CentralIdentification),
    (PDU_IDENTITY_INFORMATION, Command::IdentityInformation),
    (PDU_IDENTITY_ADDRESS_INFORMATION, Command::IdentityAddressInformation),
    (PDU_SIGNING_INFORMATION, Command::SigningInformation),
];

fn pdu_mask(flags: KeyDistributionFlags) -> u8 {
    let mut mask = 0;
    if flags.encryption_key() {
        mask |= PDU_ENCRYPTION_INFORMATION | PDU_CENTRAL_IDENTIFICATION;
    }
    if flags.identity_key() {
        mask |= PDU_IDENTITY_INFORMATION | PDU_IDENTITY_ADDRESS_INFORMATION;
    }
    if flags.signing_key() {
        mask |= PDU_SIGNING_INFORMATION;
    }
    mask
}

/// Pending key-distribution PDUs for one pairing, in both directions.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyDistState {
    send: u8,
    recv: u8,
}

impl KeyDistState {
    /// Build the pending masks from the negotiated distribution flags:
    /// `send` is what the local side distributes, `recv` what the peer owes.
    pub fn new(send: KeyDistributionFlags, recv: KeyDistributionFlags) -> Self {
        Self {
            send: pdu_mask(send),
            recv: pdu_mask(recv),
        }
    }

    /// Next PDU the local side owes, if any.
    pub fn next_send(&self) -> Option<Command> {
        PDU_ORDER
            .iter()
            .find(|(bit, _)| self.send & bit != 0)
            .map(|(_, command)| *command)
    }

    /// Clear a sent PDU from the pending mask.
    pub fn mark_sent(&mut self, command: Command) {
        if let Some((bit, _)) = PDU_ORDER.iter().find(|(_, c)| *c == command) {
            self.send &= !bit;
        }
    }

    /// The PDU the peer must transmit next, if any.
    pub fn expected_recv(&self) -> Option<Command> {
        PDU_ORDER
            .iter()
            .find(|(bit, _)| self.recv & bit != 0)
            .map(|(_, command)| *command)
    }

    /// Clear a received PDU from the pending mask.
    pub fn mark_received(&mut self, command: Command) {
        if let Some((bit, _)) = PDU_ORDER.iter().find(|(_, c)| *c == command) {
            self.recv &= !bit;
        }
    }

    /// Nothing left to transmit.
    pub fn send_done(&self) -> bool {
        self.send == 0
    }

    /// Nothing left to receive.
    pub fn recv_done(&self) -> bool {
        self.recv == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_sequence_follows_distribution_order() {
        let all = KeyDistributionFlags::new(true, true, true);
        let mut state = KeyDistState::new(all, KeyDistributionFlags::NONE);
        let expected = [
            Command::EncryptionInformation,
            Command::CentralIdentification,
            Command::IdentityInformation,
            Command::IdentityAddressInformation,
            Command::SigningInformation,
        ];
        for command in expected {
            assert_eq!(state.next_send(), Some(command));
            state.mark_sent(command);
        }
        assert!(state.send_done());
        assert!(state.recv_done());
    }

    #[test]
    fn masks_drain_independently() {
        let id_only = KeyDistributionFlags::new(false, true, false);
        let sign_only = KeyDistributionFlags::new(false, false, true);
        let mut state = KeyDistState::new(id_only, sign_only);

        assert_eq!(state.next_send(), Some(Command::IdentityInformation));
        assert_eq!(state.expected_recv(), Some(Command::SigningInformation));

        state.mark_received(Command::SigningInformation);
        assert!(state.recv_done());
        assert!(!state.send_done());

        state.mark_sent(Command::IdentityInformation);
        state.mark_sent(Command::IdentityAddressInformation);
        assert!(state.send_done());
    }

    #[test]
    fn every_mask_combination_drains_to_completion() {
        for send in 0u8..8 {
            for recv in 0u8..8 {
                let send_flags = KeyDistributionFlags::from(send);
                let recv_flags = KeyDistributionFlags::from(recv);
                let mut state = KeyDistState::new(send_flags, recv_flags);
                while let Some(command) = state.next_send() {
                    state.mark_sent(command);
                }
                while let Some(command) = state.expected_recv() {
                    state.mark_received(command);
                }
                assert!(state.send_done() && state.recv_done());
            }
        }
    }
}
