use core::cell::RefCell;
use core::ops::{Deref, DerefMut};

use embassy_time::Instant;
use rand::Rng;
use rand_core::{CryptoRng, RngCore};

use crate::codec::{Decode, Encode};
use crate::crypto::{Confirm, DHKey, IdentityResolvingKey, MacKey, Nonce, PublicKey, SecretKey, SigningKey};
use crate::manager::{BondInformation, SecurityEvent, TxPacket};
use crate::oob::OobContext;
use crate::pairing::keydist::KeyDistState;
use crate::pairing::util::{
    choose_pairing_method, make_confirm_packet, make_dhkey_check_packet, make_identity_address_information_packet,
    make_identity_information_packet, make_pairing_random, make_public_key_packet, make_signing_information_packet,
    prepare_packet, CommandAndPayload, PairingMethod, PassKeyEntryAction,
};
use crate::pairing::{Event, PairingOps};
use crate::types::{
    AuthReq, BondingFlag, Command, PairingFeatures, Reason, SecurityLevel, UseOutOfBand,
    ENCRYPTION_KEY_SIZE_128_BITS, PASS_KEY_ENTRY_ROUNDS, TIMEOUT, TIMEOUT_DISABLE,
};
use crate::{Address, Error, IoCapabilities, LongTermKey, PacketPool, PassKey};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Step {
    WaitingPairingRequest,
    WaitingPublicKey,
    // Numeric comparison
    WaitingNumericComparisonRandom(NumericCompareConfirmSentTag),
    WaitingNumericComparisonResult(Option<[u8; size_of::<u128>()]>),
    // Pass key entry, payload is a confirm that arrived before the user input
    WaitingPassKeyInput(Option<[u8; size_of::<u128>()]>),
    WaitingPassKeyEntryConfirm(i32),
    WaitingPassKeyEntryRandom(i32),
    // Out of band
    WaitingOobRandom,
    WaitingDHKeyEa,
    WaitingLinkEncrypted,
    SendingKeys(KeyDistState),
    ReceivingKeys(KeyDistState),
    Success,
    Error(Error),
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct NumericCompareConfirmSentTag {}

impl NumericCompareConfirmSentTag {
    fn new<P: PacketPool, OPS: PairingOps<P>, RNG: RngCore>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<Self, Error> {
        pairing_data.local_nonce = Nonce::new(rng);
        pairing_data.confirm = Self::compute_confirm(pairing_data)?;
        let packet = make_confirm_packet(&pairing_data.confirm)?;
        match ops.try_send_packet(packet) {
            Ok(_) => (),
            Err(error) => {
                error!("[smp] Failed to send confirm {:?}", error);
                return Err(error);
            }
        }

        Ok(Self {})
    }

    fn compute_confirm(pairing_data: &PairingData) -> Result<Confirm, Error> {
        let local_public_key = pairing_data.local_public_key.as_ref().ok_or(Error::InvalidValue)?;
        let peer_public_key = pairing_data.peer_public_key.as_ref().ok_or(Error::InvalidValue)?;
        Ok(pairing_data
            .local_nonce
            .f4(local_public_key.x(), peer_public_key.x(), 0))
    }
}

struct PairingData {
    local_address: Address,
    peer_address: Address,
    peer_features: PairingFeatures,
    local_features: PairingFeatures,
    pairing_method: PairingMethod,
    peer_public_key: Option<PublicKey>,
    local_public_key: Option<PublicKey>,
    private_key: Option<SecretKey>,
    dh_key: Option<DHKey>,
    confirm: Confirm,
    local_secret_rb: u128,
    peer_secret_ra: u128,
    local_nonce: Nonce,
    peer_nonce: Nonce,
    mac_key: Option<MacKey>,
    long_term_key: LongTermKey,
    oob: OobContext,
    timeout_at: Instant,
    bond_information: Option<BondInformation>,
}

impl PairingData {
    fn want_bonding(&self) -> bool {
        matches!(self.local_features.security_properties.bond(), BondingFlag::Bonding)
            && matches!(self.peer_features.security_properties.bond(), BondingFlag::Bonding)
    }

    fn key_dist_state(&self) -> KeyDistState {
        KeyDistState::new(
            self.local_features.responder_key_distribution,
            self.local_features.initiator_key_distribution,
        )
    }
}

pub struct Pairing {
    current_step: RefCell<Step>,
    pairing_data: RefCell<PairingData>,
}

impl Pairing {
    pub fn result(&self) -> Option<Result<(), Error>> {
        let step = self.current_step.borrow();
        match step.deref() {
            Step::Success => Some(Ok(())),
            Step::Error(e) => Some(Err(e.clone())),
            _ => None,
        }
    }

    pub fn timeout_at(&self) -> Instant {
        let step = self.current_step.borrow();
        if matches!(step.deref(), Step::Success | Step::Error(_)) {
            Instant::now() + TIMEOUT_DISABLE
        } else {
            self.pairing_data.borrow().timeout_at
        }
    }

    pub fn reset_timeout(&self) {
        let mut pairing_data = self.pairing_data.borrow_mut();
        pairing_data.timeout_at = Instant::now() + TIMEOUT;
    }

    pub(crate) fn mark_timeout(&self) {
        let mut current_step = self.current_step.borrow_mut();
        if matches!(current_step.deref(), Step::Success | Step::Error(_)) {
            return;
        }
        *current_step = Step::Error(Error::Timeout);
    }

    pub fn peer_address(&self) -> Address {
        self.pairing_data.borrow().peer_address
    }

    pub fn new(local_address: Address, peer_address: Address, local_io: IoCapabilities, oob: OobContext) -> Self {
        let use_oob = if oob.peer.is_some() {
            UseOutOfBand::Present
        } else {
            UseOutOfBand::NotPresent
        };
        Self {
            current_step: RefCell::new(Step::WaitingPairingRequest),
            pairing_data: RefCell::new(PairingData {
                local_address,
                peer_address,
                local_features: PairingFeatures {
                    io_capabilities: local_io,
                    use_oob,
                    ..Default::default()
                },
                pairing_method: PairingMethod::JustWorks,
                peer_features: PairingFeatures::default(),
                peer_public_key: None,
                local_public_key: None,
                private_key: None,
                dh_key: None,
                confirm: Confirm(0),
                local_secret_rb: 0,
                peer_secret_ra: 0,
                local_nonce: Nonce(0),
                peer_nonce: Nonce(0),
                mac_key: None,
                long_term_key: LongTermKey(0),
                oob,
                timeout_at: Instant::now() + TIMEOUT,
                bond_information: None,
            }),
        }
    }

    /// Ask the central to start pairing by sending a security request.
    pub(crate) fn initiate<P: PacketPool, OPS: PairingOps<P>>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        local_io: IoCapabilities,
        oob: OobContext,
    ) -> Result<Self, Error> {
        let ret = Self::new(local_address, peer_address, local_io, oob);
        {
            let mut security_request = prepare_packet(Command::SecurityRequest)?;
            let payload = security_request.payload_mut();
            payload[0] = AuthReq::new(ops.bonding_flag()).into();
            ops.try_send_packet(security_request)?;
        }
        Ok(ret)
    }

    /// Key the controller needs to finish the encryption start the central
    /// issued with the newly derived LTK.
    pub(crate) fn link_key(&self) -> Option<LongTermKey> {
        match self.current_step.borrow().deref() {
            Step::WaitingLinkEncrypted => Some(self.pairing_data.borrow().long_term_key),
            _ => None,
        }
    }

    /// Whether a pairing request is the expected next command.
    pub(crate) fn is_waiting_pairing_request(&self) -> bool {
        matches!(self.current_step.borrow().deref(), Step::WaitingPairingRequest)
    }

    pub fn handle_l2cap_command<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        command: Command,
        payload: &[u8],
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        match self.handle_impl(CommandAndPayload { payload, command }, ops, rng) {
            Ok(()) => Ok(()),
            Err(error) => {
                error!("[smp] Failed to handle command {:?}, {:?}", command, error);
                self.current_step.replace(Step::Error(error.clone()));
                Err(error)
            }
        }
    }

    pub fn handle_event<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        event: Event,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        let current_state = self.current_step.borrow().clone();
        let next_state = match (current_state, event) {
            (Step::WaitingPairingRequest, Event::LinkEncryptedResult(res)) => {
                // Re-encryption from a stored bond, no pairing exchange ran
                if res {
                    info!("[smp] Link encrypted with bonded key!");
                    self.pairing_data.borrow_mut().bond_information = ops.try_enable_bonded_encryption()?;
                    Step::Success
                } else {
                    error!("[smp] Failed to enable encryption!");
                    Step::Error(Error::Security(Reason::KeyRejected))
                }
            }
            (Step::WaitingLinkEncrypted, Event::LinkEncryptedResult(res)) => {
                if res {
                    info!("[smp] Link encrypted!");
                    let pairing_data = self.pairing_data.borrow();
                    if pairing_data.want_bonding() {
                        let dist = pairing_data.key_dist_state();
                        // The responder distributes its keys first
                        if !dist.send_done() {
                            Step::SendingKeys(dist)
                        } else if !dist.recv_done() {
                            Step::ReceivingKeys(dist)
                        } else {
                            Step::Success
                        }
                    } else {
                        Step::Success
                    }
                } else {
                    error!("[smp] Failed to enable encryption!");
                    Step::Error(Error::Security(Reason::KeyRejected))
                }
            }
            (Step::WaitingNumericComparisonResult(ea), Event::PassKeyConfirm) => {
                if let Some(ea) = ea {
                    let mut pairing_data = self.pairing_data.borrow_mut();
                    Self::handle_dhkey_ea(&ea, ops, pairing_data.deref_mut())?
                } else {
                    Step::WaitingDHKeyEa
                }
            }
            (Step::WaitingNumericComparisonResult(_), Event::PassKeyCancel) => {
                Step::Error(Error::Security(Reason::NumericComparisonFailed))
            }
            (Step::WaitingPassKeyInput(confirm), Event::PassKeyInput(input)) => {
                let mut pairing_data = self.pairing_data.borrow_mut();
                pairing_data.local_secret_rb = input as u128;
                pairing_data.peer_secret_ra = pairing_data.local_secret_rb;
                match confirm {
                    Some(payload) => Self::handle_pass_key_confirm(0, &payload, ops, pairing_data.deref_mut(), rng)?,
                    None => Step::WaitingPassKeyEntryConfirm(0),
                }
            }
            (Step::WaitingPassKeyInput(_), Event::PassKeyCancel) => {
                Step::Error(Error::Security(Reason::PasskeyEntryFailed))
            }
            (x, Event::PassKeyConfirm | Event::PassKeyCancel | Event::PassKeyInput(_)) => x,
            _ => Step::Error(Error::InvalidState),
        };

        self.handle_step_result(next_state, ops)
    }

    pub fn security_level(&self) -> SecurityLevel {
        let step = self.current_step.borrow();
        match step.deref() {
            Step::SendingKeys(_) | Step::ReceivingKeys(_) | Step::Success => self
                .pairing_data
                .borrow()
                .bond_information
                .as_ref()
                .map(|x| x.security_level)
                .unwrap_or(SecurityLevel::NoEncryption),
            _ => SecurityLevel::NoEncryption,
        }
    }

    fn handle_step_result<P: PacketPool, OPS: PairingOps<P>>(&self, next_step: Step, ops: &mut OPS) -> Result<(), Error> {
        match next_step {
            Step::Error(x) => {
                self.current_step.replace(Step::Error(x.clone()));
                ops.try_send_connection_event(SecurityEvent::PairingFailed(x.clone()))?;
                Err(x)
            }
            Step::SendingKeys(dist) => {
                self.current_step.replace(Step::SendingKeys(dist));
                self.send_keys(dist, ops)
            }
            x => {
                let is_success = matches!(x, Step::Success);
                self.current_step.replace(x);
                if is_success {
                    let pairing_data = self.pairing_data.borrow();
                    if let Some(bond) = pairing_data.bond_information.as_ref() {
                        let pairing_bond = if pairing_data.want_bonding() {
                            ops.try_update_bond_information(bond)?;
                            Some(bond.clone())
                        } else {
                            None
                        };
                        ops.try_send_connection_event(SecurityEvent::PairingComplete {
                            security_level: bond.security_level,
                            bond: pairing_bond,
                        })?;
                    } else {
                        error!("[smp] No bond information stored");
                    }
                }
                Ok(())
            }
        }
    }

    fn send_keys<P: PacketPool, OPS: PairingOps<P>>(&self, dist: KeyDistState, ops: &mut OPS) -> Result<(), Error> {
        let mut dist = dist;
        while let Some(command) = dist.next_send() {
            let packet = Self::make_key_packet::<P, OPS>(command, ops)?;
            if let Err(error) = ops.try_send_packet(packet) {
                // The initiator is expected to retry; park here and let the
                // pairing timeout produce the failure if it never does.
                warn!("[smp] Failed to send key distribution packet {:?}", error);
                return Ok(());
            }
            dist.mark_sent(command);
            self.current_step.replace(Step::SendingKeys(dist));
        }
        let next = if !dist.recv_done() {
            Step::ReceivingKeys(dist)
        } else {
            Step::Success
        };
        self.handle_step_result(next, ops)
    }

    fn make_key_packet<P: PacketPool, OPS: PairingOps<P>>(command: Command, ops: &mut OPS) -> Result<TxPacket<P>, Error> {
        match command {
            Command::IdentityInformation => {
                let irk = ops.local_irk().unwrap_or_default();
                make_identity_information_packet(&irk)
            }
            Command::IdentityAddressInformation => {
                let address = ops.local_identity_address();
                make_identity_address_information_packet(&address)
            }
            Command::SigningInformation => {
                let csrk = ops.local_signing_key().unwrap_or(SigningKey::new(0));
                make_signing_information_packet(&csrk)
            }
            // The LTK is derived, never distributed, in secure connections
            _ => Err(Error::InvalidState),
        }
    }

    fn handle_impl<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        &self,
        command: CommandAndPayload,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        let current_step = self.current_step.borrow().clone();
        let next_step = {
            let mut pairing_data = self.pairing_data.borrow_mut();
            let pairing_data = pairing_data.deref_mut();
            trace!("[smp] Handling {:?}, step {:?}", command.command, current_step);
            match (current_step, command.command) {
                (Step::WaitingPairingRequest, Command::PairingRequest) => {
                    Self::handle_pairing_request(command.payload, ops, pairing_data)?;
                    Self::send_pairing_response(ops, pairing_data)?;
                    Step::WaitingPublicKey
                }
                (Step::WaitingPublicKey, Command::PairingPublicKey) => {
                    Self::handle_public_key(command.payload, pairing_data);
                    Self::generate_private_public_key_pair(pairing_data, rng)?;
                    Self::send_public_key(ops, pairing_data.local_public_key.as_ref().unwrap())?;
                    match pairing_data.pairing_method {
                        PairingMethod::OutOfBand => {
                            Self::check_oob_confirm(pairing_data)?;
                            Step::WaitingOobRandom
                        }
                        PairingMethod::PassKeyEntry { peripheral, .. } => {
                            if peripheral == PassKeyEntryAction::Display {
                                pairing_data.local_secret_rb =
                                    rng.sample(rand::distributions::Uniform::new_inclusive(0, 999999));
                                pairing_data.peer_secret_ra = pairing_data.local_secret_rb;
                                ops.try_send_connection_event(SecurityEvent::PassKeyDisplay(PassKey(
                                    pairing_data.local_secret_rb as u32,
                                )))?;
                                Step::WaitingPassKeyEntryConfirm(0)
                            } else {
                                ops.try_send_connection_event(SecurityEvent::PassKeyInput)?;
                                Step::WaitingPassKeyInput(None)
                            }
                        }
                        _ => Step::WaitingNumericComparisonRandom(NumericCompareConfirmSentTag::new(
                            ops,
                            pairing_data,
                            rng,
                        )?),
                    }
                }
                (Step::WaitingNumericComparisonRandom(_), Command::PairingRandom) => {
                    Self::handle_numeric_compare_random(command.payload, pairing_data)?;
                    Self::send_nonce(ops, &pairing_data.local_nonce)?;
                    Self::numeric_compare_confirm(ops, pairing_data)?
                }
                (Step::WaitingNumericComparisonResult(None), Command::PairingDhKeyCheck) => {
                    let ea: [u8; size_of::<u128>()] = command.payload.try_into().map_err(|_| Error::InvalidValue)?;
                    Step::WaitingNumericComparisonResult(Some(ea))
                }
                (Step::WaitingOobRandom, Command::PairingRandom) => {
                    pairing_data.peer_nonce = Nonce(u128::from_le_bytes(
                        command.payload.try_into().map_err(|_| Error::InvalidValue)?,
                    ));
                    pairing_data.local_nonce = Nonce::new(rng);
                    Self::send_nonce(ops, &pairing_data.local_nonce)?;
                    Step::WaitingDHKeyEa
                }
                (Step::WaitingPassKeyInput(_), Command::PairingConfirm) => {
                    let confirm: [u8; size_of::<u128>()] =
                        command.payload.try_into().map_err(|_| Error::InvalidValue)?;
                    Step::WaitingPassKeyInput(Some(confirm))
                }
                (Step::WaitingPassKeyEntryConfirm(round), Command::PairingConfirm) => {
                    Self::handle_pass_key_confirm(round, command.payload, ops, pairing_data, rng)?
                }
                (Step::WaitingPassKeyEntryRandom(round), Command::PairingRandom) => {
                    Self::handle_pass_key_random(round, command.payload, ops, pairing_data)?
                }
                (Step::WaitingDHKeyEa, Command::PairingDhKeyCheck) => {
                    Self::handle_dhkey_ea(command.payload, ops, pairing_data)?
                }
                (Step::ReceivingKeys(mut dist), received) if dist.expected_recv() == Some(received) => {
                    Self::handle_key_distribution(received, command.payload, pairing_data)?;
                    dist.mark_received(received);
                    if !dist.recv_done() {
                        Step::ReceivingKeys(dist)
                    } else {
                        Step::Success
                    }
                }
                (x, Command::KeypressNotification) => x,

                _ => return Err(Error::InvalidState),
            }
        };

        self.handle_step_result(next_step, ops)
    }

    fn handle_pairing_request<P: PacketPool, OPS: PairingOps<P>>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<(), Error> {
        let peer_features = PairingFeatures::decode(payload).map_err(|_| Error::Security(Reason::InvalidParameters))?;
        if peer_features.maximum_encryption_key_size < ENCRYPTION_KEY_SIZE_128_BITS {
            return Err(Error::Security(Reason::EncryptionKeySize));
        }
        if !peer_features.security_properties.secure_connection() {
            return Err(Error::Security(Reason::UnspecifiedReason));
        }

        pairing_data.peer_features = peer_features;
        pairing_data.local_features.security_properties = AuthReq::new(ops.bonding_flag());
        // Narrow the requested distribution to what each side can deliver
        pairing_data.local_features.initiator_key_distribution = peer_features
            .initiator_key_distribution
            .negotiate(crate::types::KeyDistributionFlags::new(true, true, true), true);
        pairing_data.local_features.responder_key_distribution = peer_features
            .responder_key_distribution
            .negotiate(ops.local_key_distribution(), true);
        pairing_data.pairing_method = choose_pairing_method(pairing_data.peer_features, pairing_data.local_features);
        info!("[smp] Pairing method {:?}", pairing_data.pairing_method);
        Ok(())
    }

    fn send_pairing_response<P: PacketPool, OPS: PairingOps<P>>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<(), Error> {
        let mut packet = prepare_packet::<P>(Command::PairingResponse)?;

        let response = packet.payload_mut();
        pairing_data
            .local_features
            .encode(response)
            .map_err(|_| Error::InvalidValue)?;

        match ops.try_send_packet(packet) {
            Ok(_) => (),
            Err(error) => {
                error!("[smp] Failed to respond to request {:?}", error);
                return Err(error);
            }
        }

        Ok(())
    }

    fn handle_public_key(payload: &[u8], pairing_data: &mut PairingData) {
        let peer_public_key = PublicKey::from_bytes(payload);
        pairing_data.peer_public_key = Some(peer_public_key);
    }

    fn generate_private_public_key_pair<RNG: CryptoRng + RngCore>(
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        // With OOB pairing our commitment sent out of band binds the key pair
        let (secret_key, public_key) = if pairing_data.pairing_method == PairingMethod::OutOfBand
            && matches!(pairing_data.peer_features.use_oob, UseOutOfBand::Present)
        {
            let local = pairing_data
                .oob
                .local
                .as_ref()
                .ok_or(Error::Security(Reason::OobNotAvailable))?;
            (local.secret.clone(), local.public)
        } else {
            let secret_key = SecretKey::new(rng);
            let public_key = secret_key.public_key();
            (secret_key, public_key)
        };
        let peer_public_key = pairing_data
            .peer_public_key
            .ok_or(Error::Security(Reason::InvalidParameters))?;
        pairing_data.dh_key = Some(
            secret_key
                .dh_key(peer_public_key)
                .ok_or(Error::Security(Reason::InvalidParameters))?,
        );
        pairing_data.local_public_key = Some(public_key);
        pairing_data.private_key = Some(secret_key);

        Ok(())
    }

    fn send_public_key<P: PacketPool, OPS: PairingOps<P>>(ops: &mut OPS, public_key: &PublicKey) -> Result<(), Error> {
        let packet = make_public_key_packet::<P>(public_key).map_err(|_| Error::Security(Reason::InvalidParameters))?;

        match ops.try_send_packet(packet) {
            Ok(_) => (),
            Err(error) => {
                error!("[smp] Failed to send public key {:?}", error);
                return Err(error);
            }
        }

        Ok(())
    }

    /// Verify the central's out of band commitment and fix the ra/rb secrets
    /// for the DHKey checks
    // ([Vol 3] Part H, Section 2.3.5.6.4).
    fn check_oob_confirm(pairing_data: &mut PairingData) -> Result<(), Error> {
        let peer_public_key = pairing_data.peer_public_key.ok_or(Error::InvalidValue)?;
        if let Some(peer) = pairing_data.oob.peer.as_ref() {
            let expected = Nonce(peer.rand).f4(peer_public_key.x(), peer_public_key.x(), 0);
            if expected.0 != peer.confirm {
                error!("[smp] Out of band confirm mismatch");
                return Err(Error::Security(Reason::ConfirmValueFailed));
            }
            pairing_data.peer_secret_ra = peer.rand;
        } else {
            pairing_data.peer_secret_ra = 0;
        }

        pairing_data.local_secret_rb = if matches!(pairing_data.peer_features.use_oob, UseOutOfBand::Present) {
            pairing_data
                .oob
                .local
                .as_ref()
                .ok_or(Error::Security(Reason::OobNotAvailable))?
                .rand
        } else {
            0
        };
        Ok(())
    }

    fn handle_numeric_compare_random(payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        pairing_data.peer_nonce = Nonce(u128::from_le_bytes(
            payload
                .try_into()
                .map_err(|_| Error::Security(Reason::InvalidParameters))?,
        ));

        Ok(())
    }

    fn send_nonce<P: PacketPool, OPS: PairingOps<P>>(ops: &mut OPS, nonce: &Nonce) -> Result<(), Error> {
        let packet = make_pairing_random::<P>(nonce).map_err(|_| Error::Security(Reason::InvalidParameters))?;

        match ops.try_send_packet(packet) {
            Ok(_) => (),
            Err(error) => {
                error!("[smp] Failed to send pairing random {:?}", error);
                return Err(error);
            }
        }

        Ok(())
    }

    fn compute_ltk(pairing_data: &mut PairingData) -> Result<(), Error> {
        let (mac, ltk) = pairing_data.dh_key.as_ref().ok_or(Error::InvalidValue)?.f5(
            pairing_data.peer_nonce,
            pairing_data.local_nonce,
            pairing_data.peer_address,
            pairing_data.local_address,
        );

        pairing_data.mac_key = Some(mac);
        pairing_data.long_term_key = ltk;
        Ok(())
    }

    fn handle_dhkey_ea<P: PacketPool, OPS: PairingOps<P>>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        Self::compute_ltk(pairing_data)?;
        let expected_payload = pairing_data
            .mac_key
            .as_ref()
            .ok_or(Error::InvalidValue)?
            .f6(
                pairing_data.peer_nonce,
                pairing_data.local_nonce,
                pairing_data.local_secret_rb,
                pairing_data.peer_features.as_io_cap(),
                pairing_data.peer_address,
                pairing_data.local_address,
            )
            .0
            .to_le_bytes();

        if expected_payload != payload {
            Err(Error::Security(Reason::DHKeyCheckFailed))
        } else {
            Self::send_dhkey_eb(ops, pairing_data)?;
            let bond = ops.try_enable_encryption(
                &pairing_data.long_term_key,
                pairing_data.pairing_method.security_level(),
                pairing_data.want_bonding(),
                0,
                [0; 8],
            )?;
            pairing_data.bond_information = Some(bond);
            Ok(Step::WaitingLinkEncrypted)
        }
    }

    fn send_dhkey_eb<P: PacketPool, OPS: PairingOps<P>>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<(), Error> {
        let check = pairing_data.mac_key.as_ref().ok_or(Error::InvalidValue)?.f6(
            pairing_data.local_nonce,
            pairing_data.peer_nonce,
            pairing_data.peer_secret_ra,
            pairing_data.local_features.as_io_cap(),
            pairing_data.local_address,
            pairing_data.peer_address,
        );

        let check = make_dhkey_check_packet(&check)?;
        ops.try_send_packet(check)?;
        Ok(())
    }

    fn numeric_compare_confirm<P: PacketPool, OPS: PairingOps<P>>(
        ops: &mut OPS,
        pairing_data: &PairingData,
    ) -> Result<Step, Error> {
        let peer_public_key = pairing_data.peer_public_key.ok_or(Error::InvalidValue)?;
        let local_public_key = pairing_data.local_public_key.ok_or(Error::InvalidValue)?;
        let vb = pairing_data
            .peer_nonce
            .g2(peer_public_key.x(), local_public_key.x(), &pairing_data.local_nonce);

        if pairing_data.pairing_method == PairingMethod::JustWorks {
            info!("[smp] Just works pairing with compare {}", vb.0);
            Ok(Step::WaitingDHKeyEa)
        } else {
            info!("[smp] Numeric comparison pairing with compare {}", vb.0);
            ops.try_send_connection_event(SecurityEvent::PassKeyConfirm(PassKey(vb.0)))?;
            Ok(Step::WaitingNumericComparisonResult(None))
        }
    }

    fn handle_pass_key_confirm<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        round: i32,
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<Step, Error> {
        pairing_data.confirm = Confirm(u128::from_le_bytes(
            payload
                .try_into()
                .map_err(|_| Error::Security(Reason::InvalidParameters))?,
        ));
        pairing_data.local_nonce = Nonce::new(rng);
        let z = 0x80 | ((pairing_data.local_secret_rb & (1 << round)) >> round);
        let confirm_to_send = pairing_data.local_nonce.f4(
            pairing_data.local_public_key.ok_or(Error::InvalidValue)?.x(),
            pairing_data.peer_public_key.ok_or(Error::InvalidValue)?.x(),
            z as u8,
        );
        let packet = make_confirm_packet(&confirm_to_send)?;
        ops.try_send_packet(packet)?;
        Ok(Step::WaitingPassKeyEntryRandom(round))
    }

    fn handle_pass_key_random<P: PacketPool, OPS: PairingOps<P>>(
        round: i32,
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        pairing_data.peer_nonce = Nonce(u128::from_le_bytes(
            payload
                .try_into()
                .map_err(|_| Error::Security(Reason::InvalidParameters))?,
        ));
        let round = round as u128;
        let z = 0x80 | ((pairing_data.local_secret_rb & (1 << round)) >> round);
        let expected_confirm = pairing_data.peer_nonce.f4(
            pairing_data.peer_public_key.ok_or(Error::InvalidValue)?.x(),
            pairing_data.local_public_key.ok_or(Error::InvalidValue)?.x(),
            z as u8,
        );

        if pairing_data.confirm != expected_confirm {
            error!(
                "[smp] Confirm and computed confirm mismatch: {:?} != {:?}",
                pairing_data.confirm.0, expected_confirm.0
            );
            Err(Error::Security(Reason::ConfirmValueFailed))
        } else {
            let nonce_packet = make_pairing_random(&pairing_data.local_nonce)?;
            ops.try_send_packet(nonce_packet)?;
            if round == (PASS_KEY_ENTRY_ROUNDS - 1) as u128 {
                Ok(Step::WaitingDHKeyEa)
            } else {
                Ok(Step::WaitingPassKeyEntryConfirm((round + 1) as i32))
            }
        }
    }

    fn handle_key_distribution(command: Command, payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        match command {
            Command::IdentityInformation => {
                let irk = IdentityResolvingKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.identity.irk = Some(irk);
                }
                trace!("[smp] Received IRK");
            }
            Command::IdentityAddressInformation => {
                let address = crate::pairing::central::decode_identity_address(payload)?;
                pairing_data.peer_address = address;
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.identity.bd_addr = address.addr;
                }
                trace!("[smp] Received identity address {:?}", address.addr);
            }
            Command::SigningInformation => {
                let csrk = SigningKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.csrk = Some(csrk);
                }
                trace!("[smp] Received CSRK");
            }
            _ => return Err(Error::InvalidState),
        }
        Ok(())
    }
}
