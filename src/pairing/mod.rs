//! Pairing state machines, one per pairing class and role.
//!
//! Every machine consumes Security Manager commands and user/host events and
//! produces outgoing packets and security events through the [`PairingOps`]
//! seam. A command or event arriving in a step that does not expect it fails
//! the pairing with an unspecified reason on the wire, which is the guard
//! against replayed and out-of-order peer messages.

use bt_hci::param::ConnHandle;
use embassy_time::Instant;
use rand_core::{CryptoRng, RngCore};

use crate::crypto::{IdentityResolvingKey, SigningKey};
use crate::manager::{BondInformation, SecurityEvent, TxPacket};
use crate::oob::OobContext;
use crate::types::{BondingFlag, Command, KeyDistributionFlags, SecurityLevel};
use crate::{Address, Error, IoCapabilities, LongTermKey, PacketPool};

pub mod central;
mod keydist;
pub mod legacy_central;
pub mod legacy_peripheral;
pub mod peripheral;
pub(crate) mod util;

/// Host-side effects a pairing state machine can trigger.
pub trait PairingOps<P: PacketPool> {
    /// Transmit a security manager PDU to the peer.
    fn try_send_packet(&mut self, packet: TxPacket<P>) -> Result<(), Error>;
    /// Look up a stored bond for the peer.
    fn find_bond(&self) -> Option<BondInformation>;
    /// Start encryption from a stored bond, if one exists.
    fn try_enable_bonded_encryption(&mut self) -> Result<Option<BondInformation>, Error>;
    /// Start (or accept) link encryption with freshly derived key material.
    fn try_enable_encryption(
        &mut self,
        ltk: &LongTermKey,
        security_level: SecurityLevel,
        is_bonded: bool,
        ediv: u16,
        rand: [u8; 8],
    ) -> Result<BondInformation, Error>;
    /// Persist updated bond information.
    fn try_update_bond_information(&mut self, bond: &BondInformation) -> Result<(), Error>;
    /// Handle of the connection being paired.
    fn connection_handle(&mut self) -> ConnHandle;
    /// Deliver an event to the application.
    fn try_send_connection_event(&mut self, event: SecurityEvent) -> Result<(), Error>;
    /// Whether the local device wants to bond.
    fn bonding_flag(&self) -> BondingFlag;
    /// Key types the local side is able to distribute.
    fn local_key_distribution(&self) -> KeyDistributionFlags;
    /// Local identity resolving key, if configured.
    fn local_irk(&self) -> Option<IdentityResolvingKey>;
    /// Local identity address distributed during bonding.
    fn local_identity_address(&self) -> Address;
    /// Local connection signature resolving key, if configured.
    fn local_signing_key(&self) -> Option<SigningKey>;
}

/// Events fed into a pairing state machine by the host or the user.
pub enum Event {
    /// Link encryption completed (or failed).
    LinkEncryptedResult(bool),
    /// The user confirmed the displayed comparison value.
    PassKeyConfirm,
    /// The user rejected the displayed comparison value or cancelled entry.
    PassKeyCancel,
    /// The user typed a passkey.
    PassKeyInput(u32),
}

/// An in-progress pairing, dispatching on pairing class and role.
pub enum Pairing {
    Central(central::Pairing),
    Peripheral(peripheral::Pairing),
    LegacyCentral(legacy_central::Pairing),
    LegacyPeripheral(legacy_peripheral::Pairing),
}

impl Pairing {
    pub(crate) fn is_central(&self) -> bool {
        matches!(self, Pairing::Central(_) | Pairing::LegacyCentral(_))
    }

    pub(crate) fn result(&self) -> Option<Result<(), Error>> {
        match self {
            Pairing::Central(c) => c.result(),
            Pairing::Peripheral(p) => p.result(),
            Pairing::LegacyCentral(c) => c.result(),
            Pairing::LegacyPeripheral(p) => p.result(),
        }
    }

    pub(crate) fn handle_l2cap_command<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        command: Command,
        payload: &[u8],
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self {
            Pairing::Central(central) => central.handle_l2cap_command(command, payload, ops, rng),
            Pairing::Peripheral(peripheral) => peripheral.handle_l2cap_command(command, payload, ops, rng),
            Pairing::LegacyCentral(central) => central.handle_l2cap_command(command, payload, ops, rng),
            Pairing::LegacyPeripheral(peripheral) => peripheral.handle_l2cap_command(command, payload, ops, rng),
        }
    }

    pub(crate) fn handle_event<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        event: Event,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self {
            Pairing::Central(central) => central.handle_event(event, ops, rng),
            Pairing::Peripheral(peripheral) => peripheral.handle_event(event, ops, rng),
            Pairing::LegacyCentral(central) => central.handle_event(event, ops, rng),
            Pairing::LegacyPeripheral(peripheral) => peripheral.handle_event(event, ops, rng),
        }
    }

    pub(crate) fn security_level(&self) -> SecurityLevel {
        match self {
            Pairing::Central(c) => c.security_level(),
            Pairing::Peripheral(p) => p.security_level(),
            Pairing::LegacyCentral(c) => c.security_level(),
            Pairing::LegacyPeripheral(p) => p.security_level(),
        }
    }

    pub(crate) fn new_central(
        local_address: Address,
        peer_address: Address,
        local_io: IoCapabilities,
        oob: OobContext,
    ) -> Pairing {
        Pairing::Central(central::Pairing::new_idle(local_address, peer_address, local_io, oob))
    }

    pub(crate) fn initiate_central<P: PacketPool, OPS: PairingOps<P>>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        local_io: IoCapabilities,
        oob: OobContext,
    ) -> Result<Self, Error> {
        Ok(Pairing::Central(central::Pairing::initiate(
            local_address,
            peer_address,
            ops,
            local_io,
            oob,
        )?))
    }

    pub(crate) fn new_peripheral(
        local_address: Address,
        peer_address: Address,
        local_io: IoCapabilities,
        oob: OobContext,
    ) -> Pairing {
        Pairing::Peripheral(peripheral::Pairing::new(local_address, peer_address, local_io, oob))
    }

    pub(crate) fn new_legacy_peripheral(
        local_address: Address,
        peer_address: Address,
        local_io: IoCapabilities,
    ) -> Pairing {
        Pairing::LegacyPeripheral(legacy_peripheral::Pairing::new(local_address, peer_address, local_io))
    }

    pub(crate) fn initiate_peripheral<P: PacketPool, OPS: PairingOps<P>>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        local_io: IoCapabilities,
        oob: OobContext,
    ) -> Result<Self, Error> {
        Ok(Pairing::Peripheral(peripheral::Pairing::initiate(
            local_address,
            peer_address,
            ops,
            local_io,
            oob,
        )?))
    }

    /// Switch from a LESC central to a legacy central when the pairing
    /// response shows the peer does not support secure connections.
    pub(crate) fn switch_to_legacy_central(self) -> Result<Pairing, Error> {
        match self {
            Pairing::Central(lesc_central) => Ok(Pairing::LegacyCentral(lesc_central.into_legacy())),
            _ => Err(Error::InvalidState),
        }
    }

    pub(crate) fn is_waiting_bonded_encryption(&self) -> bool {
        match self {
            Pairing::Central(c) => c.is_waiting_bonded_encryption(),
            _ => false,
        }
    }

    /// Key the controller should use to answer a long term key request
    /// raised while this pairing is in flight.
    pub(crate) fn link_key(&self) -> Option<LongTermKey> {
        match self {
            Pairing::Peripheral(p) => p.link_key(),
            Pairing::LegacyPeripheral(p) => p.link_key(),
            _ => None,
        }
    }

    /// A responder session that asked for pairing with a security request is
    /// still waiting for the pairing request itself.
    pub(crate) fn expects_pairing_request(&self) -> bool {
        match self {
            Pairing::Peripheral(p) => p.is_waiting_pairing_request(),
            Pairing::LegacyPeripheral(p) => p.is_waiting_pairing_request(),
            _ => false,
        }
    }

    pub(crate) fn peer_address(&self) -> Address {
        match self {
            Pairing::Central(central) => central.peer_address(),
            Pairing::Peripheral(per) => per.peer_address(),
            Pairing::LegacyCentral(central) => central.peer_address(),
            Pairing::LegacyPeripheral(per) => per.peer_address(),
        }
    }

    pub(crate) fn timeout_at(&self) -> Instant {
        match self {
            Pairing::Central(c) => c.timeout_at(),
            Pairing::Peripheral(p) => p.timeout_at(),
            Pairing::LegacyCentral(c) => c.timeout_at(),
            Pairing::LegacyPeripheral(p) => p.timeout_at(),
        }
    }

    pub(crate) fn reset_timeout(&self) {
        match self {
            Pairing::Central(c) => c.reset_timeout(),
            Pairing::Peripheral(p) => p.reset_timeout(),
            Pairing::LegacyCentral(c) => c.reset_timeout(),
            Pairing::LegacyPeripheral(p) => p.reset_timeout(),
        }
    }

    pub(crate) fn mark_timeout(&self) {
        match self {
            Pairing::Central(c) => c.mark_timeout(),
            Pairing::Peripheral(p) => p.mark_timeout(),
            Pairing::LegacyCentral(c) => c.mark_timeout(),
            Pairing::LegacyPeripheral(p) => p.mark_timeout(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use rand_chacha::{ChaCha12Core, ChaCha12Rng};
    use rand_core::SeedableRng;

    use super::*;
    use crate::oob::LocalOobData;
    use crate::packet_pool::Packet;
    use crate::types::{AuthReq, PairingFeatures, Reason, ENCRYPTION_KEY_SIZE_128_BITS};
    use crate::Identity;

    #[derive(Debug)]
    pub(crate) struct TestPacket(pub(crate) heapless::Vec<u8, 128>);

    impl AsRef<[u8]> for TestPacket {
        fn as_ref(&self) -> &[u8] {
            self.0.as_slice()
        }
    }

    impl AsMut<[u8]> for TestPacket {
        fn as_mut(&mut self) -> &mut [u8] {
            self.0.as_mut_slice()
        }
    }

    impl Packet for TestPacket {}

    #[derive(Debug)]
    pub(crate) struct HeaplessPool;

    impl PacketPool for HeaplessPool {
        type Packet = TestPacket;
        const MTU: usize = 128;

        fn allocate() -> Option<Self::Packet> {
            let mut ret = TestPacket(heapless::Vec::new());
            ret.0.resize(Self::MTU, 0).unwrap();
            Some(ret)
        }

        fn capacity() -> usize {
            isize::MAX as usize
        }
    }

    pub(crate) struct TestOps<const N: usize> {
        pub(crate) sent_packets: heapless::Vec<TxPacket<HeaplessPool>, N>,
        pub(crate) encryptions: heapless::Vec<LongTermKey, 10>,
        pub(crate) connection_events: heapless::Vec<SecurityEvent, 16>,
        pub(crate) bond_information: Option<BondInformation>,
        pub(crate) updated_bond: Option<BondInformation>,
        pub(crate) bondable: bool,
        pub(crate) key_distribution: KeyDistributionFlags,
        pub(crate) irk: Option<IdentityResolvingKey>,
        pub(crate) identity_address: Address,
        pub(crate) csrk: Option<SigningKey>,
    }

    impl<const N: usize> Default for TestOps<N> {
        fn default() -> Self {
            Self {
                sent_packets: heapless::Vec::new(),
                encryptions: heapless::Vec::new(),
                connection_events: heapless::Vec::new(),
                bond_information: None,
                updated_bond: None,
                bondable: false,
                key_distribution: KeyDistributionFlags::NONE,
                irk: None,
                identity_address: Address::public([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
                csrk: None,
            }
        }
    }

    impl<const N: usize> PairingOps<HeaplessPool> for TestOps<N> {
        fn try_send_packet(&mut self, packet: TxPacket<HeaplessPool>) -> Result<(), Error> {
            self.sent_packets.push(packet).map_err(|_| Error::OutOfMemory)
        }

        fn find_bond(&self) -> Option<BondInformation> {
            self.bond_information.clone()
        }

        fn try_enable_bonded_encryption(&mut self) -> Result<Option<BondInformation>, Error> {
            if let Some(bond) = &self.bond_information {
                self.encryptions.push(bond.ltk).unwrap();
                Ok(Some(bond.clone()))
            } else {
                Ok(None)
            }
        }

        fn try_enable_encryption(
            &mut self,
            ltk: &LongTermKey,
            security_level: SecurityLevel,
            is_bonded: bool,
            ediv: u16,
            rand: [u8; 8],
        ) -> Result<BondInformation, Error> {
            self.encryptions.push(*ltk).unwrap();
            Ok(BondInformation {
                security_level,
                identity: Identity::default(),
                ltk: *ltk,
                is_bonded,
                ediv,
                rand,
                csrk: None,
            })
        }

        fn try_update_bond_information(&mut self, bond: &BondInformation) -> Result<(), Error> {
            self.updated_bond = Some(bond.clone());
            Ok(())
        }

        fn connection_handle(&mut self) -> ConnHandle {
            ConnHandle::new(2)
        }

        fn try_send_connection_event(&mut self, event: SecurityEvent) -> Result<(), Error> {
            self.connection_events.push(event).map_err(|_| Error::OutOfMemory)
        }

        fn bonding_flag(&self) -> BondingFlag {
            if self.bondable {
                BondingFlag::Bonding
            } else {
                BondingFlag::NoBonding
            }
        }

        fn local_key_distribution(&self) -> KeyDistributionFlags {
            self.key_distribution
        }

        fn local_irk(&self) -> Option<IdentityResolvingKey> {
            self.irk
        }

        fn local_identity_address(&self) -> Address {
            self.identity_address
        }

        fn local_signing_key(&self) -> Option<SigningKey> {
            self.csrk
        }
    }

    pub(crate) fn transmit_packets<const N: usize>(
        peripheral_ops: &mut TestOps<N>,
        central_ops: &mut TestOps<N>,
        rng: &mut ChaCha12Rng,
        peripheral_pairing: &Pairing,
        central_pairing: &Pairing,
        num_central_data_sent: &mut usize,
        num_peripheral_data_sent: &mut usize,
    ) {
        let mut loop_count = 0;
        loop {
            let saved_num_central_data_sent = *num_central_data_sent;
            let saved_num_peripheral_data_sent = *num_peripheral_data_sent;

            while *num_central_data_sent < central_ops.sent_packets.len() {
                let command = central_ops.sent_packets[*num_central_data_sent].command();
                let payload: heapless::Vec<u8, 128> =
                    heapless::Vec::from_slice(central_ops.sent_packets[*num_central_data_sent].payload()).unwrap();
                peripheral_pairing
                    .handle_l2cap_command::<HeaplessPool, _, _>(command, &payload, peripheral_ops, rng)
                    .unwrap();
                *num_central_data_sent += 1;
            }

            while *num_peripheral_data_sent < peripheral_ops.sent_packets.len() {
                let command = peripheral_ops.sent_packets[*num_peripheral_data_sent].command();
                let payload: heapless::Vec<u8, 128> =
                    heapless::Vec::from_slice(peripheral_ops.sent_packets[*num_peripheral_data_sent].payload())
                        .unwrap();
                central_pairing
                    .handle_l2cap_command::<HeaplessPool, _, _>(command, &payload, central_ops, rng)
                    .unwrap();
                *num_peripheral_data_sent += 1;
            }

            if saved_num_central_data_sent == *num_central_data_sent
                && saved_num_peripheral_data_sent == *num_peripheral_data_sent
            {
                break;
            }

            loop_count += 1;
            if loop_count > 10000 {
                panic!("Too many loops");
            }
        }
    }

    fn rng() -> ChaCha12Rng {
        ChaCha12Core::seed_from_u64(1).into()
    }

    fn peripheral_address() -> Address {
        Address::random([0xff, 1, 2, 3, 4, 5])
    }

    fn central_address() -> Address {
        Address::random([0xff, 2, 2, 3, 4, 5])
    }

    struct Link {
        peripheral: Pairing,
        central: Pairing,
        peripheral_ops: TestOps<80>,
        central_ops: TestOps<80>,
        rng: ChaCha12Rng,
        central_sent: usize,
        peripheral_sent: usize,
    }

    impl Link {
        fn new(peripheral_io: IoCapabilities, central_io: IoCapabilities) -> Self {
            Self::with_oob(peripheral_io, central_io, OobContext::none(), OobContext::none())
        }

        fn with_oob(
            peripheral_io: IoCapabilities,
            central_io: IoCapabilities,
            peripheral_oob: OobContext,
            central_oob: OobContext,
        ) -> Self {
            let mut central_ops = TestOps::<80>::default();
            let peripheral_ops = TestOps::<80>::default();
            let rng = rng();

            let peripheral =
                Pairing::new_peripheral(peripheral_address(), central_address(), peripheral_io, peripheral_oob);
            let central = Pairing::initiate_central(
                central_address(),
                peripheral_address(),
                &mut central_ops,
                central_io,
                central_oob,
            )
            .unwrap();

            Self {
                peripheral,
                central,
                peripheral_ops,
                central_ops,
                rng,
                central_sent: 0,
                peripheral_sent: 0,
            }
        }

        fn pump(&mut self) {
            transmit_packets(
                &mut self.peripheral_ops,
                &mut self.central_ops,
                &mut self.rng,
                &self.peripheral,
                &self.central,
                &mut self.central_sent,
                &mut self.peripheral_sent,
            );
        }

        fn encrypt_link(&mut self) {
            assert_eq!(self.central_ops.encryptions[0], self.peripheral_ops.encryptions[0]);
            self.central
                .handle_event::<HeaplessPool, _, _>(
                    Event::LinkEncryptedResult(true),
                    &mut self.central_ops,
                    &mut self.rng,
                )
                .unwrap();
            self.peripheral
                .handle_event::<HeaplessPool, _, _>(
                    Event::LinkEncryptedResult(true),
                    &mut self.peripheral_ops,
                    &mut self.rng,
                )
                .unwrap();
            self.pump();
        }
    }

    #[test]
    fn just_works() {
        let mut link = Link::new(IoCapabilities::NoInputNoOutput, IoCapabilities::NoInputNoOutput);
        link.pump();
        link.encrypt_link();

        assert!(matches!(
            link.central_ops.connection_events[0],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::Encrypted,
                bond: None
            }
        ));
        assert!(matches!(
            link.peripheral_ops.connection_events[0],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::Encrypted,
                bond: None
            }
        ));
        assert_eq!(link.central.security_level(), SecurityLevel::Encrypted);
        assert_eq!(link.peripheral.security_level(), SecurityLevel::Encrypted);
    }

    #[test]
    fn numeric_compare() {
        let mut link = Link::new(IoCapabilities::DisplayYesNo, IoCapabilities::DisplayYesNo);
        link.pump();

        let (central_numeric, peripheral_numeric) = {
            let central = match &link.central_ops.connection_events[0] {
                SecurityEvent::PassKeyConfirm(n) => n,
                _ => panic!("Unexpected connection event"),
            };

            let peripheral = match &link.peripheral_ops.connection_events[0] {
                SecurityEvent::PassKeyConfirm(n) => n,
                _ => panic!("Unexpected connection event"),
            };

            (*central, *peripheral)
        };

        assert_eq!(central_numeric, peripheral_numeric);
        link.central
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyConfirm, &mut link.central_ops, &mut link.rng)
            .unwrap();
        link.peripheral
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyConfirm, &mut link.peripheral_ops, &mut link.rng)
            .unwrap();

        link.pump();
        link.encrypt_link();

        assert!(matches!(
            link.central_ops.connection_events[1],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::EncryptedAuthenticated,
                bond: None
            }
        ));
        assert!(matches!(
            link.peripheral_ops.connection_events[1],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::EncryptedAuthenticated,
                bond: None
            }
        ));
    }

    #[test]
    fn numeric_compare_cancel_fails_pairing() {
        let mut link = Link::new(IoCapabilities::DisplayYesNo, IoCapabilities::DisplayYesNo);
        link.pump();

        let result = link.central.handle_event::<HeaplessPool, _, _>(
            Event::PassKeyCancel,
            &mut link.central_ops,
            &mut link.rng,
        );
        assert_eq!(result, Err(Error::Security(Reason::NumericComparisonFailed)));
        assert!(matches!(
            link.central_ops.connection_events.last(),
            Some(SecurityEvent::PairingFailed(Error::Security(
                Reason::NumericComparisonFailed
            )))
        ));
    }

    #[test]
    fn pass_key_entry_keyboard_only() {
        let mut link = Link::new(IoCapabilities::KeyboardOnly, IoCapabilities::KeyboardOnly);
        link.pump();

        assert!(matches!(
            link.central_ops.connection_events[0],
            SecurityEvent::PassKeyInput
        ));
        assert!(matches!(
            link.peripheral_ops.connection_events[0],
            SecurityEvent::PassKeyInput
        ));

        link.central
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyInput(123456), &mut link.central_ops, &mut link.rng)
            .unwrap();
        link.peripheral
            .handle_event::<HeaplessPool, _, _>(
                Event::PassKeyInput(123456),
                &mut link.peripheral_ops,
                &mut link.rng,
            )
            .unwrap();

        link.pump();
        link.encrypt_link();

        assert!(matches!(
            link.central_ops.connection_events[1],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::EncryptedAuthenticated,
                bond: None
            }
        ));
        assert_eq!(link.central.security_level(), SecurityLevel::EncryptedAuthenticated);
        assert_eq!(link.peripheral.security_level(), SecurityLevel::EncryptedAuthenticated);
    }

    #[test]
    fn pass_key_entry_wrong_passkey_fails() {
        let mut link = Link::new(IoCapabilities::KeyboardOnly, IoCapabilities::KeyboardOnly);
        link.pump();

        link.central
            .handle_event::<HeaplessPool, _, _>(Event::PassKeyInput(123456), &mut link.central_ops, &mut link.rng)
            .unwrap();
        link.peripheral
            .handle_event::<HeaplessPool, _, _>(
                Event::PassKeyInput(654321),
                &mut link.peripheral_ops,
                &mut link.rng,
            )
            .unwrap();

        // Differing passkeys trip a confirm check within the first rounds
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| link.pump()));
        assert!(result.is_err());
        let failed = link
            .central
            .result()
            .or(link.peripheral.result())
            .expect("one side must have failed");
        assert_eq!(failed, Err(Error::Security(Reason::ConfirmValueFailed)));
    }

    #[test]
    fn pass_key_entry_peripheral_display() {
        let mut link = Link::new(IoCapabilities::DisplayOnly, IoCapabilities::KeyboardOnly);
        link.pump();

        let pass_key = match &link.peripheral_ops.connection_events[0] {
            SecurityEvent::PassKeyDisplay(pk) => *pk,
            _ => panic!("Unexpected connection event"),
        };

        assert!(matches!(
            link.central_ops.connection_events[0],
            SecurityEvent::PassKeyInput
        ));

        link.central
            .handle_event::<HeaplessPool, _, _>(
                Event::PassKeyInput(pass_key.value()),
                &mut link.central_ops,
                &mut link.rng,
            )
            .unwrap();

        link.pump();
        link.encrypt_link();

        assert_eq!(link.central.security_level(), SecurityLevel::EncryptedAuthenticated);
        assert_eq!(link.peripheral.security_level(), SecurityLevel::EncryptedAuthenticated);
    }

    #[test]
    fn pass_key_entry_central_display() {
        let mut link = Link::new(IoCapabilities::KeyboardOnly, IoCapabilities::DisplayOnly);
        link.pump();

        let pass_key = match &link.central_ops.connection_events[0] {
            SecurityEvent::PassKeyDisplay(pk) => *pk,
            _ => panic!("Unexpected connection event"),
        };

        assert!(matches!(
            link.peripheral_ops.connection_events[0],
            SecurityEvent::PassKeyInput
        ));

        link.peripheral
            .handle_event::<HeaplessPool, _, _>(
                Event::PassKeyInput(pass_key.value()),
                &mut link.peripheral_ops,
                &mut link.rng,
            )
            .unwrap();

        link.pump();
        link.encrypt_link();

        assert_eq!(link.central.security_level(), SecurityLevel::EncryptedAuthenticated);
        assert_eq!(link.peripheral.security_level(), SecurityLevel::EncryptedAuthenticated);
    }

    #[test]
    fn bondable_just_works_distributes_keys() {
        let mut link = Link::new(IoCapabilities::NoInputNoOutput, IoCapabilities::NoInputNoOutput);
        link.peripheral_ops.bondable = true;
        link.central_ops.bondable = true;
        link.peripheral_ops.key_distribution = KeyDistributionFlags::new(true, true, true);
        link.central_ops.key_distribution = KeyDistributionFlags::new(true, true, true);
        link.peripheral_ops.irk = Some(IdentityResolvingKey::new(0x1111));
        link.central_ops.irk = Some(IdentityResolvingKey::new(0x2222));
        link.peripheral_ops.csrk = Some(SigningKey::new(0x3333));
        link.central_ops.csrk = Some(SigningKey::new(0x4444));
        link.peripheral_ops.identity_address = Address::public([0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f]);
        link.central_ops.identity_address = Address::public([0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f]);

        link.pump();
        link.encrypt_link();

        // Both sides distributed IRK, identity address and CSRK (no LTK in
        // secure connections); the peer's keys end up in the bond.
        let central_bond = match link.central_ops.connection_events.last().unwrap() {
            SecurityEvent::PairingComplete {
                bond: Some(bond),
                security_level: SecurityLevel::Encrypted,
            } => bond.clone(),
            x => panic!("Unexpected event {:?}", core::mem::discriminant(x)),
        };
        let peripheral_bond = match link.peripheral_ops.connection_events.last().unwrap() {
            SecurityEvent::PairingComplete {
                bond: Some(bond),
                security_level: SecurityLevel::Encrypted,
            } => bond.clone(),
            x => panic!("Unexpected event {:?}", core::mem::discriminant(x)),
        };

        assert!(central_bond.is_bonded);
        assert!(peripheral_bond.is_bonded);
        assert_eq!(central_bond.ltk, peripheral_bond.ltk);
        assert_eq!(central_bond.identity.irk, Some(IdentityResolvingKey::new(0x1111)));
        assert_eq!(peripheral_bond.identity.irk, Some(IdentityResolvingKey::new(0x2222)));
        assert_eq!(central_bond.csrk, Some(SigningKey::new(0x3333)));
        assert_eq!(peripheral_bond.csrk, Some(SigningKey::new(0x4444)));
        // Identity addresses replaced the connection addresses
        assert_eq!(
            central_bond.identity.bd_addr,
            link.peripheral_ops.identity_address.addr
        );
        assert_eq!(peripheral_bond.identity.bd_addr, link.central_ops.identity_address.addr);
    }

    #[test]
    fn sc_oob_both_sides() {
        let mut rng = rng();
        let central_keys = LocalOobData::generate(&mut rng);
        let peripheral_keys = LocalOobData::generate(&mut rng);
        let central_shared = central_keys.shared_data(central_address());
        let peripheral_shared = peripheral_keys.shared_data(peripheral_address());

        let mut link = Link::with_oob(
            IoCapabilities::NoInputNoOutput,
            IoCapabilities::NoInputNoOutput,
            OobContext {
                local: Some(peripheral_keys),
                peer: Some(central_shared),
            },
            OobContext {
                local: Some(central_keys),
                peer: Some(peripheral_shared),
            },
        );
        link.pump();
        link.encrypt_link();

        assert!(matches!(
            link.central_ops.connection_events[0],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::EncryptedAuthenticated,
                bond: None
            }
        ));
        assert!(matches!(
            link.peripheral_ops.connection_events[0],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::EncryptedAuthenticated,
                bond: None
            }
        ));
    }

    #[test]
    fn sc_oob_central_has_peripheral_data() {
        let mut rng = rng();
        let peripheral_keys = LocalOobData::generate(&mut rng);
        let peripheral_shared = peripheral_keys.shared_data(peripheral_address());

        // Only the central received OOB data; the peripheral's random counts,
        // the central's is zero on both sides.
        let mut link = Link::with_oob(
            IoCapabilities::NoInputNoOutput,
            IoCapabilities::NoInputNoOutput,
            OobContext {
                local: Some(peripheral_keys),
                peer: None,
            },
            OobContext {
                local: None,
                peer: Some(peripheral_shared),
            },
        );
        link.pump();
        link.encrypt_link();

        assert_eq!(link.central.security_level(), SecurityLevel::EncryptedAuthenticated);
        assert_eq!(link.peripheral.security_level(), SecurityLevel::EncryptedAuthenticated);
    }

    #[test]
    fn sc_oob_confirm_mismatch_fails() {
        let mut rng = rng();
        let peripheral_keys = LocalOobData::generate(&mut rng);
        let mut peripheral_shared = peripheral_keys.shared_data(peripheral_address());
        peripheral_shared.confirm ^= 1;

        let mut link = Link::with_oob(
            IoCapabilities::NoInputNoOutput,
            IoCapabilities::NoInputNoOutput,
            OobContext {
                local: Some(peripheral_keys),
                peer: None,
            },
            OobContext {
                local: None,
                peer: Some(peripheral_shared),
            },
        );
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| link.pump()));
        assert!(result.is_err());
        assert_eq!(
            link.central.result(),
            Some(Err(Error::Security(Reason::ConfirmValueFailed)))
        );
    }

    #[test]
    fn bonded_central_initiates() {
        let peripheral = peripheral_address();
        let central = central_address();

        let mut peripheral_ops = TestOps::<80>::default();
        let mut central_ops = TestOps::<80>::default();
        central_ops.bond_information = Some(BondInformation {
            security_level: SecurityLevel::EncryptedAuthenticated,
            is_bonded: true,
            ltk: LongTermKey(1),
            identity: Identity {
                irk: None,
                bd_addr: peripheral.addr,
            },
            ediv: 0,
            rand: [0; 8],
            csrk: None,
        });

        peripheral_ops.bond_information = Some(BondInformation {
            security_level: SecurityLevel::EncryptedAuthenticated,
            is_bonded: true,
            ltk: LongTermKey(1),
            identity: Identity {
                irk: None,
                bd_addr: central.addr,
            },
            ediv: 0,
            rand: [0; 8],
            csrk: None,
        });

        let mut rng = rng();

        let peripheral_pairing =
            Pairing::new_peripheral(peripheral, central, IoCapabilities::NoInputNoOutput, OobContext::none());
        let central_pairing = Pairing::initiate_central(
            central,
            peripheral,
            &mut central_ops,
            IoCapabilities::NoInputNoOutput,
            OobContext::none(),
        )
        .unwrap();
        assert!(central_pairing.is_waiting_bonded_encryption());
        assert_eq!(central_ops.sent_packets.len(), 0);
        assert_eq!(peripheral_ops.sent_packets.len(), 0);
        assert_eq!(central_ops.encryptions.len(), 1);
        assert_eq!(central_ops.encryptions[0], LongTermKey(1));

        central_pairing
            .handle_event::<HeaplessPool, _, _>(Event::LinkEncryptedResult(true), &mut central_ops, &mut rng)
            .unwrap();
        peripheral_pairing
            .handle_event::<HeaplessPool, _, _>(Event::LinkEncryptedResult(true), &mut peripheral_ops, &mut rng)
            .unwrap();

        assert!(matches!(
            central_ops.connection_events[0],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::EncryptedAuthenticated,
                bond: None
            }
        ));
        assert!(matches!(
            peripheral_ops.connection_events[0],
            SecurityEvent::PairingComplete {
                security_level: SecurityLevel::EncryptedAuthenticated,
                bond: None
            }
        ));
        assert_eq!(central_ops.connection_events.len(), 1);
        assert_eq!(peripheral_ops.connection_events.len(), 1);
    }

    #[test]
    fn bonded_peripheral_initiates() {
        let peripheral = peripheral_address();
        let central = central_address();

        let mut peripheral_ops = TestOps::<80>::default();
        let mut central_ops = TestOps::<80>::default();
        central_ops.bond_information = Some(BondInformation {
            security_level: SecurityLevel::EncryptedAuthenticated,
            is_bonded: true,
            ltk: LongTermKey(1),
            identity: Identity {
                irk: None,
                bd_addr: peripheral.addr,
            },
            ediv: 0,
            rand: [0; 8],
            csrk: None,
        });

        let mut rng = rng();

        let peripheral_pairing = Pairing::initiate_peripheral(
            peripheral,
            central,
            &mut peripheral_ops,
            IoCapabilities::NoInputNoOutput,
            OobContext::none(),
        )
        .unwrap();
        let central_pairing =
            Pairing::new_central(central, peripheral, IoCapabilities::NoInputNoOutput, OobContext::none());

        let mut num_central_data_sent = 0;
        let mut num_peripheral_data_sent = 0;
        transmit_packets(
            &mut peripheral_ops,
            &mut central_ops,
            &mut rng,
            &peripheral_pairing,
            &central_pairing,
            &mut num_central_data_sent,
            &mut num_peripheral_data_sent,
        );

        // The security request triggered encryption from the stored bond
        assert_eq!(central_ops.sent_packets.len(), 0);
        assert_eq!(peripheral_ops.sent_packets.len(), 1);
        assert_eq!(central_ops.encryptions.len(), 1);
        assert_eq!(central_ops.encryptions[0], LongTermKey(1));
    }

    #[test]
    fn dhkey_check_mismatch_fails() {
        let mut link = Link::new(IoCapabilities::NoInputNoOutput, IoCapabilities::NoInputNoOutput);

        // Feed packets by hand so the central's DHKey check can be corrupted
        // before the peripheral sees it.
        loop {
            let mut progress = false;
            while link.central_sent < link.central_ops.sent_packets.len() {
                let index = link.central_sent;
                link.central_sent += 1;
                progress = true;
                let command = link.central_ops.sent_packets[index].command();
                let mut payload: heapless::Vec<u8, 128> =
                    heapless::Vec::from_slice(link.central_ops.sent_packets[index].payload()).unwrap();
                if command == Command::PairingDhKeyCheck {
                    payload[0] ^= 0xff;
                    let result = link.peripheral.handle_l2cap_command::<HeaplessPool, _, _>(
                        command,
                        &payload,
                        &mut link.peripheral_ops,
                        &mut link.rng,
                    );
                    assert_eq!(result, Err(Error::Security(Reason::DHKeyCheckFailed)));
                    assert_eq!(
                        link.peripheral.result(),
                        Some(Err(Error::Security(Reason::DHKeyCheckFailed)))
                    );
                    return;
                }
                link.peripheral
                    .handle_l2cap_command::<HeaplessPool, _, _>(
                        command,
                        &payload,
                        &mut link.peripheral_ops,
                        &mut link.rng,
                    )
                    .unwrap();
            }
            while link.peripheral_sent < link.peripheral_ops.sent_packets.len() {
                let index = link.peripheral_sent;
                link.peripheral_sent += 1;
                progress = true;
                let command = link.peripheral_ops.sent_packets[index].command();
                let payload: heapless::Vec<u8, 128> =
                    heapless::Vec::from_slice(link.peripheral_ops.sent_packets[index].payload()).unwrap();
                link.central
                    .handle_l2cap_command::<HeaplessPool, _, _>(command, &payload, &mut link.central_ops, &mut link.rng)
                    .unwrap();
            }
            if !progress {
                panic!("pairing stalled before the DHKey check");
            }
        }
    }

    #[test]
    fn confirm_mismatch_fails() {
        let mut link = Link::new(IoCapabilities::NoInputNoOutput, IoCapabilities::NoInputNoOutput);

        // Corrupt the peripheral's confirm; the central detects the mismatch
        // when it verifies against the peripheral's random.
        loop {
            let mut progress = false;
            while link.central_sent < link.central_ops.sent_packets.len() {
                let index = link.central_sent;
                link.central_sent += 1;
                progress = true;
                let command = link.central_ops.sent_packets[index].command();
                let payload: heapless::Vec<u8, 128> =
                    heapless::Vec::from_slice(link.central_ops.sent_packets[index].payload()).unwrap();
                link.peripheral
                    .handle_l2cap_command::<HeaplessPool, _, _>(
                        command,
                        &payload,
                        &mut link.peripheral_ops,
                        &mut link.rng,
                    )
                    .unwrap();
            }
            while link.peripheral_sent < link.peripheral_ops.sent_packets.len() {
                let index = link.peripheral_sent;
                link.peripheral_sent += 1;
                progress = true;
                let command = link.peripheral_ops.sent_packets[index].command();
                let mut payload: heapless::Vec<u8, 128> =
                    heapless::Vec::from_slice(link.peripheral_ops.sent_packets[index].payload()).unwrap();
                if command == Command::PairingConfirm {
                    payload[0] ^= 0xff;
                }
                let result = link.central.handle_l2cap_command::<HeaplessPool, _, _>(
                    command,
                    &payload,
                    &mut link.central_ops,
                    &mut link.rng,
                );
                if result == Err(Error::Security(Reason::ConfirmValueFailed)) {
                    assert_eq!(
                        link.central.result(),
                        Some(Err(Error::Security(Reason::ConfirmValueFailed)))
                    );
                    return;
                }
                result.unwrap();
            }
            if !progress {
                panic!("pairing completed without a confirm check");
            }
        }
    }

    #[test]
    fn timeout_terminates_session() {
        let mut link = Link::new(IoCapabilities::NoInputNoOutput, IoCapabilities::NoInputNoOutput);
        link.pump();

        link.central.mark_timeout();
        assert_eq!(link.central.result(), Some(Err(Error::Timeout)));
        // The deadline is pushed out once the session is terminal
        assert!(link.central.timeout_at() > Instant::now() + crate::types::TIMEOUT);

        // Further peer input is rejected without reviving the session
        let result = link.central.handle_l2cap_command::<HeaplessPool, _, _>(
            Command::PairingRandom,
            &[0u8; 16],
            &mut link.central_ops,
            &mut link.rng,
        );
        assert_eq!(result, Err(Error::InvalidState));
    }

    /// Build a legacy central/peripheral pair. A legacy central only exists
    /// by downgrade, so the pairing request an SC central would have sent is
    /// handed to the legacy machine and returned for the peripheral.
    fn legacy_link(bondable: bool, key_distribution: KeyDistributionFlags) -> (Link, [u8; 7]) {
        use crate::codec::Encode;

        let mut central_ops = TestOps::<80>::default();
        let mut peripheral_ops = TestOps::<80>::default();
        central_ops.bondable = bondable;
        peripheral_ops.bondable = bondable;
        central_ops.key_distribution = key_distribution;
        peripheral_ops.key_distribution = key_distribution;

        let local_features = PairingFeatures {
            io_capabilities: IoCapabilities::NoInputNoOutput,
            security_properties: AuthReq::new(central_ops.bonding_flag()),
            initiator_key_distribution: key_distribution,
            responder_key_distribution: KeyDistributionFlags::new(true, true, true),
            maximum_encryption_key_size: ENCRYPTION_KEY_SIZE_128_BITS,
            ..Default::default()
        };
        let mut preq = [0u8; 7];
        preq[0] = 0x01;
        local_features.encode(&mut preq[1..]).unwrap();

        let central = Pairing::LegacyCentral(legacy_central::Pairing::from_lesc_switch(
            central_address(),
            peripheral_address(),
            local_features,
            preq,
        ));
        let peripheral =
            Pairing::new_legacy_peripheral(peripheral_address(), central_address(), IoCapabilities::NoInputNoOutput);

        (
            Link {
                peripheral,
                central,
                peripheral_ops,
                central_ops,
                rng: rng(),
                central_sent: 0,
                peripheral_sent: 0,
            },
            preq,
        )
    }

    #[test]
    fn legacy_just_works() {
        let (mut link, preq) = legacy_link(false, KeyDistributionFlags::NONE);
        // The peripheral answers the request already on the air
        link.peripheral
            .handle_l2cap_command::<HeaplessPool, _, _>(
                Command::PairingRequest,
                &preq[1..],
                &mut link.peripheral_ops,
                &mut link.rng,
            )
            .unwrap();
        link.pump();

        // Both sides agreed on the same short term key
        link.encrypt_link();

        assert_eq!(link.central.security_level(), SecurityLevel::Encrypted);
        assert_eq!(link.peripheral.security_level(), SecurityLevel::Encrypted);
        assert!(matches!(
            link.central_ops.connection_events.last(),
            Some(SecurityEvent::PairingComplete {
                security_level: SecurityLevel::Encrypted,
                bond: None
            })
        ));
    }

    #[test]
    fn legacy_bonding_distributes_ltk() {
        let (mut link, preq) = legacy_link(true, KeyDistributionFlags::new(true, false, false));
        link.peripheral
            .handle_l2cap_command::<HeaplessPool, _, _>(
                Command::PairingRequest,
                &preq[1..],
                &mut link.peripheral_ops,
                &mut link.rng,
            )
            .unwrap();
        link.pump();
        link.encrypt_link();

        // The central's bond carries the LTK, EDIV and Rand distributed by
        // the peripheral; the peripheral's bond carries its own.
        let central_bond = link.central_ops.updated_bond.clone().expect("central bonded");
        let peripheral_bond = link.peripheral_ops.updated_bond.clone().expect("peripheral bonded");
        assert!(central_bond.is_bonded);
        assert!(peripheral_bond.is_bonded);
        assert_eq!(central_bond.ltk, peripheral_bond.ltk);
        assert_eq!(central_bond.ediv, peripheral_bond.ediv);
        assert_eq!(central_bond.rand, peripheral_bond.rand);
        // The distributed LTK is not the short term key
        assert_ne!(central_bond.ltk, link.central_ops.encryptions[0]);
    }
}
