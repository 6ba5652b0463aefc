use core::cell::RefCell;
use core::ops::{Deref, DerefMut};

use embassy_time::Instant;
use rand::Rng;
use rand_core::{CryptoRng, RngCore};

use crate::codec::{Decode, Encode};
use crate::crypto::{Confirm, DHKey, MacKey, Nonce, PublicKey, SecretKey};
use crate::manager::{BondInformation, SecurityEvent, TxPacket};
use crate::oob::OobContext;
use crate::pairing::keydist::KeyDistState;
use crate::pairing::util::{
    choose_pairing_method, make_confirm_packet, make_dhkey_check_packet, make_identity_address_information_packet,
    make_identity_information_packet, make_pairing_random, make_public_key_packet, make_signing_information_packet,
    prepare_packet, CommandAndPayload, PairingMethod, PassKeyEntryAction,
};
use crate::pairing::{legacy_central, Event, PairingOps};
use crate::types::{
    AuthReq, BondingFlag, Command, KeyDistributionFlags, PairingFeatures, Reason, SecurityLevel, UseOutOfBand,
    ENCRYPTION_KEY_SIZE_128_BITS, PASS_KEY_ENTRY_ROUNDS, TIMEOUT, TIMEOUT_DISABLE,
};
use crate::{Address, Error, IoCapabilities, LongTermKey, PacketPool, PassKey};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Step {
    Idle,
    WaitingPairingResponse(PairingRequestSentTag),
    WaitingPublicKey,
    // Numeric comparison
    WaitingNumericComparisonConfirm,
    WaitingNumericComparisonRandom,
    WaitingNumericComparisonResult,
    // Pass key entry
    WaitingPassKeyInput,
    WaitingPassKeyEntryConfirm(PassKeyEntryConfirmSentTag),
    WaitingPassKeyEntryRandom(i32),
    // Out of band
    WaitingOobRandom,
    WaitingDHKeyEb(DHKeyEaSentTag),
    WaitingLinkEncrypted,
    WaitingBondedLinkEncryption,
    ReceivingKeys(KeyDistState),
    SendingKeys(KeyDistState),
    Success,
    Error(Error),
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct PairingRequestSentTag {}

impl PairingRequestSentTag {
    fn new<P: PacketPool, OPS: PairingOps<P>>(pairing_data: &mut PairingData, ops: &mut OPS) -> Result<Self, Error> {
        let mut packet = prepare_packet::<P>(Command::PairingRequest)?;

        let payload = packet.payload_mut();
        pairing_data
            .local_features
            .encode(payload)
            .map_err(|_| Error::InvalidValue)?;
        // Keep the request bytes, c1 needs them if the peer turns out to be legacy only
        pairing_data.preq[0] = u8::from(Command::PairingRequest);
        pairing_data.preq[1..7].copy_from_slice(payload);

        match ops.try_send_packet(packet) {
            Ok(_) => {}
            Err(error) => {
                error!("[smp] Failed to send pairing request {:?}", error);
                return Err(error);
            }
        }

        Ok(Self {})
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct PassKeyEntryConfirmSentTag(i32);

impl PassKeyEntryConfirmSentTag {
    fn new<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        round: i32,
        pairing_data: &mut PairingData,
        ops: &mut OPS,
        rng: &mut RNG,
    ) -> Result<PassKeyEntryConfirmSentTag, Error> {
        pairing_data.local_nonce = Nonce::new(rng);
        let rai = 0x80u8 | (((pairing_data.local_secret_ra & (1 << round as u128)) >> (round as u128)) as u8);
        let cai = pairing_data.local_nonce.f4(
            pairing_data.local_public_key.as_ref().ok_or(Error::InvalidValue)?.x(),
            pairing_data.peer_public_key.as_ref().ok_or(Error::InvalidValue)?.x(),
            rai,
        );
        let confirm = make_confirm_packet(&cai)?;
        ops.try_send_packet(confirm)?;
        Ok(PassKeyEntryConfirmSentTag(round))
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct DHKeyEaSentTag {}

impl DHKeyEaSentTag {
    fn new<P: PacketPool, OPS: PairingOps<P>>(
        pairing_data: &mut PairingData,
        ops: &mut OPS,
    ) -> Result<DHKeyEaSentTag, Error> {
        let (mac, ltk) = {
            let dh_key = pairing_data.dh_key.as_ref().ok_or(Error::InvalidValue)?;
            dh_key.f5(
                pairing_data.local_nonce,
                pairing_data.peer_nonce,
                pairing_data.local_address,
                pairing_data.peer_address,
            )
        };

        let ea = mac.f6(
            pairing_data.local_nonce,
            pairing_data.peer_nonce,
            pairing_data.peer_secret_rb,
            pairing_data.local_features.as_io_cap(),
            pairing_data.local_address,
            pairing_data.peer_address,
        );

        let check = make_dhkey_check_packet(&ea)?;
        ops.try_send_packet(check)?;
        pairing_data.mac_key = Some(mac);
        pairing_data.ltk = Some(ltk);
        Ok(DHKeyEaSentTag {})
    }
}

struct PairingData {
    local_address: Address,
    peer_address: Address,
    local_features: PairingFeatures,
    peer_features: PairingFeatures,
    pairing_method: PairingMethod,
    local_public_key: Option<PublicKey>,
    private_key: Option<SecretKey>,
    peer_public_key: Option<PublicKey>,
    dh_key: Option<DHKey>,
    local_secret_ra: u128,
    peer_secret_rb: u128,
    confirm: Confirm,
    local_nonce: Nonce,
    peer_nonce: Nonce,
    mac_key: Option<MacKey>,
    ltk: Option<LongTermKey>,
    /// Pairing Request command bytes (opcode + 6 feature bytes)
    preq: [u8; 7],
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
            self.local_features.initiator_key_distribution,
            self.local_features.responder_key_distribution,
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
        if matches!(step.deref(), Step::Idle | Step::Success | Step::Error(_)) {
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
        if matches!(current_step.deref(), Step::Idle | Step::Success | Step::Error(_)) {
            return;
        }
        *current_step = Step::Error(Error::Timeout);
    }

    pub(crate) fn new_idle(
        local_address: Address,
        peer_address: Address,
        local_io: IoCapabilities,
        oob: OobContext,
    ) -> Pairing {
        let use_oob = if oob.peer.is_some() {
            UseOutOfBand::Present
        } else {
            UseOutOfBand::NotPresent
        };
        let pairing_data = PairingData {
            pairing_method: PairingMethod::JustWorks,
            local_address,
            peer_address,
            peer_public_key: None,
            local_public_key: None,
            local_secret_ra: 0,
            peer_secret_rb: 0,
            peer_features: PairingFeatures::default(),
            mac_key: None,
            local_features: PairingFeatures {
                io_capabilities: local_io,
                use_oob,
                ..Default::default()
            },
            peer_nonce: Nonce(0),
            local_nonce: Nonce(0),
            dh_key: None,
            confirm: Confirm(0),
            ltk: None,
            private_key: None,
            preq: [0; 7],
            oob,
            timeout_at: Instant::MAX,
            bond_information: None,
        };
        Self {
            pairing_data: RefCell::new(pairing_data),
            current_step: RefCell::new(Step::Idle),
        }
    }

    pub(crate) fn initiate<P: PacketPool, OPS: PairingOps<P>>(
        local_address: Address,
        peer_address: Address,
        ops: &mut OPS,
        local_io: IoCapabilities,
        oob: OobContext,
    ) -> Result<Pairing, Error> {
        let ret = Self::new_idle(local_address, peer_address, local_io, oob);
        {
            let mut pairing_data = ret.pairing_data.borrow_mut();
            Self::prepare_local_features(pairing_data.deref_mut(), ops);
            let next_step = if let Some(bond) = ops.try_enable_bonded_encryption()? {
                pairing_data.bond_information = Some(bond);
                Step::WaitingBondedLinkEncryption
            } else {
                Step::WaitingPairingResponse(PairingRequestSentTag::new(pairing_data.deref_mut(), ops)?)
            };
            ret.current_step.replace(next_step);
        }
        ret.reset_timeout();
        Ok(ret)
    }

    fn prepare_local_features<P: PacketPool, OPS: PairingOps<P>>(pairing_data: &mut PairingData, ops: &mut OPS) {
        pairing_data.local_features.security_properties = AuthReq::new(ops.bonding_flag());
        // Offer the keys we can distribute, request everything; the response narrows both
        pairing_data.local_features.initiator_key_distribution = ops.local_key_distribution();
        pairing_data.local_features.responder_key_distribution = KeyDistributionFlags::new(true, true, true);
    }

    pub fn peer_address(&self) -> Address {
        self.pairing_data.borrow().peer_address
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

    /// Switch to a legacy central after a pairing response without the SC bit.
    /// The pairing request is already on the air; the legacy machine takes
    /// over from the same request bytes.
    pub(crate) fn into_legacy(self) -> legacy_central::Pairing {
        let pairing_data = self.pairing_data.into_inner();
        legacy_central::Pairing::from_lesc_switch(
            pairing_data.local_address,
            pairing_data.peer_address,
            pairing_data.local_features,
            pairing_data.preq,
        )
    }

    pub(crate) fn is_waiting_bonded_encryption(&self) -> bool {
        matches!(self.current_step.borrow().deref(), Step::WaitingBondedLinkEncryption)
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
            (Step::WaitingLinkEncrypted, Event::LinkEncryptedResult(res)) => {
                if res {
                    info!("[smp] Link encrypted!");
                    let pairing_data = self.pairing_data.borrow();
                    if pairing_data.want_bonding() {
                        let dist = pairing_data.key_dist_state();
                        // The responder distributes its keys first
                        if !dist.recv_done() {
                            Step::ReceivingKeys(dist)
                        } else if !dist.send_done() {
                            Step::SendingKeys(dist)
                        } else {
                            Step::Success
                        }
                    } else {
                        Step::Success
                    }
                } else {
                    error!("[smp] Link encryption failed!");
                    Step::Error(Error::Security(Reason::KeyRejected))
                }
            }
            (Step::WaitingBondedLinkEncryption, Event::LinkEncryptedResult(res)) => {
                if res {
                    info!("[smp] Link encrypted using bonded key!");
                    Step::Success
                } else {
                    error!("[smp] Link encryption with bonded key failed!");
                    Step::Error(Error::Security(Reason::KeyRejected))
                }
            }
            (Step::WaitingNumericComparisonResult, Event::PassKeyConfirm) => {
                Step::WaitingDHKeyEb(DHKeyEaSentTag::new(self.pairing_data.borrow_mut().deref_mut(), ops)?)
            }
            (Step::WaitingNumericComparisonResult, Event::PassKeyCancel) => {
                Step::Error(Error::Security(Reason::NumericComparisonFailed))
            }
            (Step::WaitingPassKeyInput, Event::PassKeyInput(input)) => {
                let mut pairing_data = self.pairing_data.borrow_mut();
                pairing_data.local_secret_ra = input as u128;
                pairing_data.peer_secret_rb = pairing_data.local_secret_ra;
                Step::WaitingPassKeyEntryConfirm(PassKeyEntryConfirmSentTag::new(
                    0,
                    pairing_data.deref_mut(),
                    ops,
                    rng,
                )?)
            }
            (Step::WaitingPassKeyInput, Event::PassKeyCancel) => {
                Step::Error(Error::Security(Reason::PasskeyEntryFailed))
            }
            (x, Event::PassKeyConfirm | Event::PassKeyCancel | Event::PassKeyInput(_)) => x,
            _ => Step::Error(Error::InvalidState),
        };

        self.handle_step_result(next_state, ops)
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
            ops.try_send_packet(packet)?;
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
                let csrk = ops.local_signing_key().unwrap_or(crate::crypto::SigningKey::new(0));
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
                (Step::Idle, Command::SecurityRequest) => {
                    Self::prepare_local_features(pairing_data, ops);
                    if let Some(bond) = ops.try_enable_bonded_encryption()? {
                        pairing_data.bond_information = Some(bond);
                        Step::WaitingBondedLinkEncryption
                    } else {
                        Step::WaitingPairingResponse(PairingRequestSentTag::new(pairing_data, ops)?)
                    }
                }
                (Step::WaitingPairingResponse(x), Command::SecurityRequest) => {
                    // Security requests while waiting for a pairing response shall be ignored
                    Step::WaitingPairingResponse(x)
                }
                (Step::WaitingPairingResponse(_), Command::PairingResponse) => {
                    Self::handle_pairing_response(command.payload, pairing_data)?;
                    Self::generate_private_public_key_pair(pairing_data, rng)?;
                    Self::send_public_key(ops, pairing_data.local_public_key.as_ref().unwrap())?;
                    Step::WaitingPublicKey
                }
                (Step::WaitingPublicKey, Command::PairingPublicKey) => {
                    Self::handle_public_key(command.payload, pairing_data)?;
                    match pairing_data.pairing_method {
                        PairingMethod::OutOfBand => {
                            Self::check_oob_confirm(pairing_data)?;
                            pairing_data.local_nonce = Nonce::new(rng);
                            Self::send_nonce(ops, &pairing_data.local_nonce)?;
                            Step::WaitingOobRandom
                        }
                        PairingMethod::PassKeyEntry { central, .. } => {
                            if central == PassKeyEntryAction::Display {
                                pairing_data.local_secret_ra =
                                    rng.sample(rand::distributions::Uniform::new_inclusive(0, 999999));
                                pairing_data.peer_secret_rb = pairing_data.local_secret_ra;
                                ops.try_send_connection_event(SecurityEvent::PassKeyDisplay(PassKey(
                                    pairing_data.local_secret_ra as u32,
                                )))?;
                                Step::WaitingPassKeyEntryConfirm(PassKeyEntryConfirmSentTag::new(
                                    0,
                                    pairing_data,
                                    ops,
                                    rng,
                                )?)
                            } else {
                                ops.try_send_connection_event(SecurityEvent::PassKeyInput)?;
                                Step::WaitingPassKeyInput
                            }
                        }
                        _ => Step::WaitingNumericComparisonConfirm,
                    }
                }
                (Step::WaitingNumericComparisonConfirm, Command::PairingConfirm) => {
                    Self::handle_numeric_compare_confirm(command.payload, pairing_data, rng)?;
                    Self::send_nonce(ops, &pairing_data.local_nonce)?;
                    Step::WaitingNumericComparisonRandom
                }
                (Step::WaitingNumericComparisonRandom, Command::PairingRandom) => {
                    Self::handle_numeric_compare_random(command.payload, pairing_data, ops)?
                }
                (Step::WaitingOobRandom, Command::PairingRandom) => {
                    pairing_data.peer_nonce = Nonce(u128::from_le_bytes(
                        command.payload.try_into().map_err(|_| Error::InvalidValue)?,
                    ));
                    Step::WaitingDHKeyEb(DHKeyEaSentTag::new(pairing_data, ops)?)
                }
                (Step::WaitingPassKeyEntryConfirm(round), Command::PairingConfirm) => {
                    Self::handle_pass_key_confirm(command.payload, pairing_data)?;
                    Self::send_nonce(ops, &pairing_data.local_nonce)?;
                    Step::WaitingPassKeyEntryRandom(round.0)
                }
                (Step::WaitingPassKeyEntryRandom(round), Command::PairingRandom) => {
                    Self::handle_pass_key_random(round, command.payload, pairing_data)?;
                    if round == PASS_KEY_ENTRY_ROUNDS - 1 {
                        Step::WaitingDHKeyEb(DHKeyEaSentTag::new(pairing_data, ops)?)
                    } else {
                        Step::WaitingPassKeyEntryConfirm(PassKeyEntryConfirmSentTag::new(
                            round + 1,
                            pairing_data,
                            ops,
                            rng,
                        )?)
                    }
                }
                (Step::WaitingDHKeyEb(_), Command::PairingDhKeyCheck) => {
                    Self::handle_dhkey_eb(command.payload, ops, pairing_data)?;
                    Step::WaitingLinkEncrypted
                }
                (Step::ReceivingKeys(mut dist), received) if dist.expected_recv() == Some(received) => {
                    Self::handle_key_distribution(received, command.payload, pairing_data)?;
                    dist.mark_received(received);
                    if !dist.recv_done() {
                        Step::ReceivingKeys(dist)
                    } else if !dist.send_done() {
                        Step::SendingKeys(dist)
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

    fn handle_pairing_response(payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        let peer_features = PairingFeatures::decode(payload).map_err(|_| Error::Security(Reason::InvalidParameters))?;
        if peer_features.maximum_encryption_key_size < ENCRYPTION_KEY_SIZE_128_BITS {
            return Err(Error::Security(Reason::EncryptionKeySize));
        }
        if !peer_features.security_properties.secure_connection() {
            return Err(Error::Security(Reason::UnspecifiedReason));
        }

        // The response narrows the requested key distribution
        pairing_data.local_features.initiator_key_distribution = pairing_data
            .local_features
            .initiator_key_distribution
            .negotiate(peer_features.initiator_key_distribution, true);
        pairing_data.local_features.responder_key_distribution = pairing_data
            .local_features
            .responder_key_distribution
            .negotiate(peer_features.responder_key_distribution, true);

        pairing_data.peer_features = peer_features;
        pairing_data.pairing_method = choose_pairing_method(pairing_data.local_features, pairing_data.peer_features);
        info!("[smp] Pairing method {:?}", pairing_data.pairing_method);

        Ok(())
    }

    fn generate_private_public_key_pair<RNG: CryptoRng + RngCore>(
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        // With OOB pairing the confirm commitment sent out of band binds our
        // public key, reuse that key pair instead of a fresh one.
        if pairing_data.pairing_method == PairingMethod::OutOfBand
            && matches!(pairing_data.peer_features.use_oob, UseOutOfBand::Present)
        {
            let local = pairing_data.oob.local.as_ref().ok_or(Error::Security(Reason::OobNotAvailable))?;
            pairing_data.local_public_key = Some(local.public);
            pairing_data.private_key = Some(local.secret.clone());
            return Ok(());
        }
        let secret_key = SecretKey::new(rng);
        let public_key = secret_key.public_key();
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

    fn handle_public_key(payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        let peer_public_key = PublicKey::from_bytes(payload);
        let secret_key = pairing_data.private_key.as_ref().ok_or(Error::InvalidValue)?;
        pairing_data.dh_key = Some(
            secret_key
                .dh_key(peer_public_key)
                .ok_or(Error::Security(Reason::InvalidParameters))?,
        );

        pairing_data.peer_public_key = Some(peer_public_key);

        Ok(())
    }

    /// Verify the peer's out of band commitment and fix the ra/rb secrets
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
            pairing_data.peer_secret_rb = peer.rand;
        } else {
            pairing_data.peer_secret_rb = 0;
        }

        // Our random counts only if the peer actually received our OOB data
        pairing_data.local_secret_ra = if matches!(pairing_data.peer_features.use_oob, UseOutOfBand::Present) {
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

    fn handle_numeric_compare_confirm<RNG: CryptoRng + RngCore>(
        payload: &[u8],
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        pairing_data.confirm = Confirm(u128::from_le_bytes(
            payload.try_into().map_err(|_| Error::InvalidValue)?,
        ));
        pairing_data.local_nonce = Nonce::new(rng);
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

    fn handle_numeric_compare_random<P: PacketPool, OPS: PairingOps<P>>(
        payload: &[u8],
        pairing_data: &mut PairingData,
        ops: &mut OPS,
    ) -> Result<Step, Error> {
        let peer_nonce = Nonce(u128::from_le_bytes(
            payload.try_into().map_err(|_| Error::InvalidValue)?,
        ));
        let expected_cb = peer_nonce.f4(
            pairing_data.peer_public_key.ok_or(Error::InvalidValue)?.x(),
            pairing_data.local_public_key.ok_or(Error::InvalidValue)?.x(),
            0,
        );
        if pairing_data.confirm != expected_cb {
            return Err(Error::Security(Reason::ConfirmValueFailed));
        }
        pairing_data.peer_nonce = peer_nonce;
        let va = pairing_data.local_nonce.g2(
            pairing_data.local_public_key.ok_or(Error::InvalidValue)?.x(),
            pairing_data.peer_public_key.ok_or(Error::InvalidValue)?.x(),
            &pairing_data.peer_nonce,
        );

        if pairing_data.pairing_method == PairingMethod::JustWorks {
            info!("[smp] Just works pairing with compare {}", va.0);
            Ok(Step::WaitingDHKeyEb(DHKeyEaSentTag::new(pairing_data, ops)?))
        } else {
            info!("[smp] Numeric comparison pairing with compare {}", va.0);
            ops.try_send_connection_event(SecurityEvent::PassKeyConfirm(PassKey(va.0)))?;
            Ok(Step::WaitingNumericComparisonResult)
        }
    }

    fn handle_dhkey_eb<P: PacketPool, OPS: PairingOps<P>>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<(), Error> {
        let expected_eb = {
            let mac_key = pairing_data.mac_key.as_ref().ok_or(Error::InvalidValue)?;
            mac_key
                .f6(
                    pairing_data.peer_nonce,
                    pairing_data.local_nonce,
                    pairing_data.local_secret_ra,
                    pairing_data.peer_features.as_io_cap(),
                    pairing_data.peer_address,
                    pairing_data.local_address,
                )
                .0
                .to_le_bytes()
        };
        if payload != expected_eb {
            return Err(Error::Security(Reason::DHKeyCheckFailed));
        }

        let bond = ops.try_enable_encryption(
            &pairing_data.ltk.ok_or(Error::InvalidValue)?,
            pairing_data.pairing_method.security_level(),
            pairing_data.want_bonding(),
            0,
            [0; 8],
        )?;
        pairing_data.bond_information = Some(bond);
        Ok(())
    }

    fn handle_pass_key_confirm(payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        let confirm = Confirm(u128::from_le_bytes(
            payload.try_into().map_err(|_| Error::InvalidValue)?,
        ));
        pairing_data.confirm = confirm;
        Ok(())
    }

    fn handle_pass_key_random(round: i32, payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        let peer_nonce = Nonce(u128::from_le_bytes(
            payload.try_into().map_err(|_| Error::InvalidValue)?,
        ));
        let rai = 0x80u8 | (((pairing_data.local_secret_ra & (1 << round as u128)) >> (round as u128)) as u8);
        let cbi = peer_nonce.f4(
            pairing_data.peer_public_key.as_ref().ok_or(Error::InvalidValue)?.x(),
            pairing_data.local_public_key.as_ref().ok_or(Error::InvalidValue)?.x(),
            rai,
        );
        if cbi != pairing_data.confirm {
            return Err(Error::Security(Reason::ConfirmValueFailed));
        }
        pairing_data.peer_nonce = peer_nonce;
        Ok(())
    }

    fn handle_key_distribution(command: Command, payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        match command {
            Command::IdentityInformation => {
                let irk = crate::crypto::IdentityResolvingKey::from_le_bytes(
                    payload.try_into().map_err(|_| Error::InvalidValue)?,
                );
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.identity.irk = Some(irk);
                }
                trace!("[smp] Received IRK");
            }
            Command::IdentityAddressInformation => {
                let address = decode_identity_address(payload)?;
                pairing_data.peer_address = address;
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.identity.bd_addr = address.addr;
                }
                trace!("[smp] Received identity address {:?}", address.addr);
            }
            Command::SigningInformation => {
                let csrk =
                    crate::crypto::SigningKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
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

pub(crate) fn decode_identity_address(payload: &[u8]) -> Result<Address, Error> {
    use bt_hci::param::{AddrKind, BdAddr};
    let kind = match payload[0] {
        0 => AddrKind::PUBLIC,
        1 => AddrKind::RANDOM,
        _ => return Err(Error::InvalidValue),
    };
    let addr = BdAddr::new(payload[1..7].try_into().map_err(|_| Error::InvalidValue)?);
    Ok(Address { kind, addr })
}
