use core::cell::RefCell;
use core::ops::{Deref, DerefMut};

use bt_hci::param::AddrKind;
use embassy_time::Instant;
use rand::Rng;
use rand_core::{CryptoRng, RngCore};

use crate::codec::{Decode, Encode};
use crate::crypto::{self, IdentityResolvingKey, SigningKey};
use crate::manager::{BondInformation, SecurityEvent, TxPacket};
use crate::pairing::central::decode_identity_address;
use crate::pairing::keydist::KeyDistState;
use crate::pairing::util::{
    choose_legacy_pairing_method, make_central_identification_packet, make_encryption_information_packet,
    make_identity_address_information_packet, make_identity_information_packet, make_pairing_random,
    make_signing_information_packet, prepare_packet, CommandAndPayload, PairingMethod, PassKeyEntryAction,
};
use crate::pairing::{Event, PairingOps};
use crate::types::{
    AuthReq, BondingFlag, Command, KeyDistributionFlags, PairingFeatures, Reason, SecurityLevel, TIMEOUT,
    TIMEOUT_DISABLE,
};
use crate::{Address, Error, IoCapabilities, LongTermKey, PacketPool, PassKey};

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Step {
    WaitingPairingRequest,
    WaitingPassKeyInput(Option<[u8; size_of::<u128>()]>),
    WaitingPairingConfirm,
    WaitingPairingRandom,
    WaitingLinkEncrypted,
    SendingKeys(KeyDistState),
    ReceivingKeys(KeyDistState),
    Success,
    Error(Error),
}

struct PairingData {
    local_address: Address,
    peer_address: Address,
    peer_features: PairingFeatures,
    local_features: PairingFeatures,
    pairing_method: PairingMethod,
    /// TK: 0 for JustWorks, passkey value for PassKey Entry
    tk: u128,
    /// Pairing Request command bytes (opcode + 6 feature bytes)
    preq: [u8; 7],
    /// Pairing Response command bytes (opcode + 6 feature bytes)
    pres: [u8; 7],
    /// Central's confirm value (Mconfirm)
    peer_confirm: u128,
    /// Peripheral's random (Srand)
    local_nonce: u128,
    /// Central's random (Mrand)
    peer_nonce: u128,
    /// Short-Term Key computed from s1
    stk: LongTermKey,
    /// LTK generated locally for distribution to the central
    local_long_term_key: LongTermKey,
    local_ediv: u16,
    local_rand: [u8; 8],
    /// LTK received from the central (key distribution)
    peer_long_term_key: LongTermKey,
    timeout_at: Instant,
    bond_information: Option<BondInformation>,
}

impl PairingData {
    fn want_bonding(&self) -> bool {
        matches!(self.local_features.security_properties.bond(), BondingFlag::Bonding)
            && matches!(self.peer_features.security_properties.bond(), BondingFlag::Bonding)
    }

    fn negotiated_key_size(&self) -> u8 {
        core::cmp::min(
            self.peer_features.maximum_encryption_key_size,
            self.local_features.maximum_encryption_key_size,
        )
    }

    fn key_dist_state(&self) -> KeyDistState {
        KeyDistState::new(
            self.local_features.responder_key_distribution,
            self.local_features.initiator_key_distribution,
        )
    }

    /// Get initiator (central) address type for c1
    fn iat(&self) -> u8 {
        if self.peer_address.kind == AddrKind::PUBLIC {
            0
        } else {
            1
        }
    }

    /// Get responder (peripheral) address type for c1
    fn rat(&self) -> u8 {
        if self.local_address.kind == AddrKind::PUBLIC {
            0
        } else {
            1
        }
    }

    /// Get initiator (central) address bytes in MSO order for c1
    fn ia(&self) -> [u8; 6] {
        let mut addr = self.peer_address.addr.into_inner();
        addr.reverse();
        addr
    }

    /// Get responder (peripheral) address bytes in MSO order for c1
    fn ra(&self) -> [u8; 6] {
        let mut addr = self.local_address.addr.into_inner();
        addr.reverse();
        addr
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

    pub fn new(local_address: Address, peer_address: Address, local_io: IoCapabilities) -> Self {
        Self {
            current_step: RefCell::new(Step::WaitingPairingRequest),
            pairing_data: RefCell::new(PairingData {
                local_address,
                peer_address,
                local_features: PairingFeatures {
                    io_capabilities: local_io,
                    ..Default::default()
                },
                pairing_method: PairingMethod::JustWorks,
                peer_features: PairingFeatures::default(),
                tk: 0,
                preq: [0; 7],
                pres: [0; 7],
                peer_confirm: 0,
                local_nonce: 0,
                peer_nonce: 0,
                stk: LongTermKey(0),
                local_long_term_key: LongTermKey(0),
                local_ediv: 0,
                local_rand: [0; 8],
                peer_long_term_key: LongTermKey(0),
                timeout_at: Instant::now() + TIMEOUT,
                bond_information: None,
            }),
        }
    }

    /// Key the controller needs when the central starts encryption: the STK
    /// while the pairing exchange is still in flight.
    pub(crate) fn link_key(&self) -> Option<LongTermKey> {
        match self.current_step.borrow().deref() {
            Step::WaitingLinkEncrypted => Some(self.pairing_data.borrow().stk),
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
                error!("[smp legacy] Failed to handle command {:?}, {:?}", command, error);
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
        let next_step = match (current_state, event) {
            (Step::WaitingPairingRequest, Event::LinkEncryptedResult(res)) => {
                // Re-encryption from a stored bond, no pairing exchange ran
                if res {
                    info!("[smp legacy] Link encrypted with bonded key!");
                    self.pairing_data.borrow_mut().bond_information = ops.try_enable_bonded_encryption()?;
                    Step::Success
                } else {
                    error!("[smp legacy] Failed to enable encryption!");
                    Step::Error(Error::Security(Reason::KeyRejected))
                }
            }
            (Step::WaitingLinkEncrypted, Event::LinkEncryptedResult(res)) => {
                if res {
                    info!("[smp legacy] Link encrypted!");
                    let pairing_data = self.pairing_data.borrow();
                    if pairing_data.want_bonding() {
                        let dist = pairing_data.key_dist_state();
                        // The peripheral distributes its keys first
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
                    error!("[smp legacy] Failed to enable encryption!");
                    Step::Error(Error::Security(Reason::KeyRejected))
                }
            }
            (Step::WaitingPassKeyInput(confirm), Event::PassKeyInput(input)) => {
                let mut pairing_data = self.pairing_data.borrow_mut();
                pairing_data.tk = input as u128;
                match confirm {
                    Some(payload) => {
                        // Mconfirm arrived before the user input
                        pairing_data.peer_confirm = u128::from_le_bytes(payload);
                        Self::send_sconfirm(ops, pairing_data.deref_mut(), rng)?;
                        Step::WaitingPairingRandom
                    }
                    None => Step::WaitingPairingConfirm,
                }
            }
            (Step::WaitingPassKeyInput(_), Event::PassKeyCancel) => {
                Step::Error(Error::Security(Reason::PasskeyEntryFailed))
            }
            (x, Event::PassKeyConfirm | Event::PassKeyCancel | Event::PassKeyInput(_)) => x,
            _ => Step::Error(Error::InvalidState),
        };

        self.handle_step_result(next_step, ops)
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
                    }
                }
                Ok(())
            }
        }
    }

    fn send_keys<P: PacketPool, OPS: PairingOps<P>>(&self, dist: KeyDistState, ops: &mut OPS) -> Result<(), Error> {
        let mut dist = dist;
        while let Some(command) = dist.next_send() {
            let packet = {
                let pairing_data = self.pairing_data.borrow();
                Self::make_key_packet::<P, OPS>(command, pairing_data.deref(), ops)?
            };
            if let Err(error) = ops.try_send_packet(packet) {
                // The initiator is expected to retry; park here and let the
                // pairing timeout produce the failure if it never does.
                warn!("[smp legacy] Failed to send key distribution packet {:?}", error);
                return Ok(());
            }
            dist.mark_sent(command);
            self.current_step.replace(Step::SendingKeys(dist));

            // After distributing our encryption key, the bond holds our own
            // (masked) LTK, EDIV and Rand so the central can re-encrypt.
            if command == Command::CentralIdentification {
                let mut pairing_data = self.pairing_data.borrow_mut();
                let ltk = pairing_data
                    .local_long_term_key
                    .mask(pairing_data.negotiated_key_size());
                let ediv = pairing_data.local_ediv;
                let rand = pairing_data.local_rand;
                let want_bonding = pairing_data.want_bonding();
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.ltk = ltk;
                    bond.ediv = ediv;
                    bond.rand = rand;
                    bond.is_bonded = want_bonding;
                }
            }
        }
        let next = if !dist.recv_done() {
            Step::ReceivingKeys(dist)
        } else {
            Step::Success
        };
        self.handle_step_result(next, ops)
    }

    fn make_key_packet<P: PacketPool, OPS: PairingOps<P>>(
        command: Command,
        pairing_data: &PairingData,
        ops: &mut OPS,
    ) -> Result<TxPacket<P>, Error> {
        match command {
            Command::EncryptionInformation => {
                let ltk = pairing_data
                    .local_long_term_key
                    .mask(pairing_data.negotiated_key_size());
                make_encryption_information_packet(&ltk)
            }
            Command::CentralIdentification => {
                make_central_identification_packet(pairing_data.local_ediv, &pairing_data.local_rand)
            }
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
            trace!("[smp legacy] Handling {:?}, step {:?}", command.command, current_step);
            match (current_step, command.command) {
                (Step::WaitingPairingRequest, Command::PairingRequest) => {
                    if ops.find_bond().is_some() {
                        ops.try_send_connection_event(SecurityEvent::BondLost)?;
                    }
                    Self::handle_pairing_request(command.payload, ops, pairing_data, rng)?
                }
                (Step::WaitingPassKeyInput(_), Command::PairingConfirm) => {
                    let confirm: [u8; size_of::<u128>()] =
                        command.payload.try_into().map_err(|_| Error::InvalidValue)?;
                    Step::WaitingPassKeyInput(Some(confirm))
                }
                (Step::WaitingPairingConfirm, Command::PairingConfirm) => {
                    pairing_data.peer_confirm = u128::from_le_bytes(
                        command
                            .payload
                            .try_into()
                            .map_err(|_| Error::Security(Reason::InvalidParameters))?,
                    );
                    Self::send_sconfirm(ops, pairing_data, rng)?;
                    Step::WaitingPairingRandom
                }
                (Step::WaitingPairingRandom, Command::PairingRandom) => {
                    Self::handle_pairing_random(command.payload, ops, pairing_data)?
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

    fn handle_pairing_request<P: PacketPool, OPS: PairingOps<P>, RNG: CryptoRng + RngCore>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<Step, Error> {
        let peer_features = PairingFeatures::decode(payload).map_err(|_| Error::Security(Reason::InvalidParameters))?;

        // Store the PairingRequest command bytes for c1
        pairing_data.preq[0] = u8::from(Command::PairingRequest);
        pairing_data.preq[1..7].copy_from_slice(payload);

        // Narrow the requested distribution to what each side can deliver
        pairing_data.local_features.initiator_key_distribution = peer_features
            .initiator_key_distribution
            .negotiate(KeyDistributionFlags::new(true, true, true), false);
        pairing_data.local_features.responder_key_distribution = peer_features
            .responder_key_distribution
            .negotiate(ops.local_key_distribution(), false);

        pairing_data.peer_features = peer_features;
        let mut auth_req = AuthReq::new_legacy(ops.bonding_flag());
        if pairing_data.local_features.io_capabilities != IoCapabilities::NoInputNoOutput {
            auth_req = auth_req.with_mitm();
        }
        pairing_data.local_features.security_properties = auth_req;
        pairing_data.pairing_method =
            choose_legacy_pairing_method(pairing_data.peer_features, pairing_data.local_features);
        info!("[smp legacy] Pairing method {:?}", pairing_data.pairing_method);

        // Send PairingResponse and store the command bytes for c1
        let mut packet = prepare_packet::<P>(Command::PairingResponse)?;
        let response = packet.payload_mut();
        pairing_data
            .local_features
            .encode(response)
            .map_err(|_| Error::InvalidValue)?;
        pairing_data.pres[0] = u8::from(Command::PairingResponse);
        pairing_data.pres[1..7].copy_from_slice(response);
        ops.try_send_packet(packet)?;

        // Generate the LTK, EDIV and Rand we distribute when bonding
        if pairing_data.want_bonding() && pairing_data.local_features.responder_key_distribution.encryption_key() {
            let mut ltk_bytes = [0u8; 16];
            rng.fill_bytes(&mut ltk_bytes);
            pairing_data.local_long_term_key = LongTermKey::from_le_bytes(ltk_bytes);
            pairing_data.local_ediv = rng.gen();
            rng.fill_bytes(&mut pairing_data.local_rand);
        }

        match pairing_data.pairing_method {
            PairingMethod::OutOfBand => Err(Error::Security(Reason::OobNotAvailable)),
            PairingMethod::PassKeyEntry { peripheral, .. } => {
                if peripheral == PassKeyEntryAction::Display {
                    pairing_data.tk = rng.sample(rand::distributions::Uniform::new_inclusive(0u32, 999999)) as u128;
                    ops.try_send_connection_event(SecurityEvent::PassKeyDisplay(PassKey(pairing_data.tk as u32)))?;
                    Ok(Step::WaitingPairingConfirm)
                } else {
                    ops.try_send_connection_event(SecurityEvent::PassKeyInput)?;
                    Ok(Step::WaitingPassKeyInput(None))
                }
            }
            PairingMethod::JustWorks => {
                pairing_data.tk = 0;
                Ok(Step::WaitingPairingConfirm)
            }
            PairingMethod::NumericComparison => {
                // Not a legacy pairing method
                Err(Error::Security(Reason::AuthenticationRequirements))
            }
        }
    }

    fn send_sconfirm<P: PacketPool, OPS: PairingOps<P>, RNG: RngCore>(
        ops: &mut OPS,
        pairing_data: &mut PairingData,
        rng: &mut RNG,
    ) -> Result<(), Error> {
        // Generate Srand
        let mut srand_bytes = [0u8; 16];
        rng.fill_bytes(&mut srand_bytes);
        pairing_data.local_nonce = u128::from_be_bytes(srand_bytes);
        if pairing_data.local_nonce == 0 {
            pairing_data.local_nonce = 1;
        }

        let sconfirm = crypto::c1(
            pairing_data.tk,
            pairing_data.local_nonce,
            &pairing_data.preq,
            &pairing_data.pres,
            pairing_data.iat(),
            &pairing_data.ia(),
            pairing_data.rat(),
            &pairing_data.ra(),
        );

        let mut packet = prepare_packet(Command::PairingConfirm)?;
        packet.payload_mut().copy_from_slice(&sconfirm.to_le_bytes());
        ops.try_send_packet(packet)?;
        Ok(())
    }

    fn handle_pairing_random<P: PacketPool, OPS: PairingOps<P>>(
        payload: &[u8],
        ops: &mut OPS,
        pairing_data: &mut PairingData,
    ) -> Result<Step, Error> {
        // Parse Mrand from the central
        let mrand_le: [u8; 16] = payload
            .try_into()
            .map_err(|_| Error::Security(Reason::InvalidParameters))?;
        pairing_data.peer_nonce = u128::from_le_bytes(mrand_le);

        // Verify: c1(TK, Mrand, ...) == stored Mconfirm
        let expected_mconfirm = crypto::c1(
            pairing_data.tk,
            pairing_data.peer_nonce,
            &pairing_data.preq,
            &pairing_data.pres,
            pairing_data.iat(),
            &pairing_data.ia(),
            pairing_data.rat(),
            &pairing_data.ra(),
        );

        if expected_mconfirm != pairing_data.peer_confirm {
            error!("[smp legacy] Confirm value mismatch");
            return Err(Error::Security(Reason::ConfirmValueFailed));
        }

        // Send Srand
        let packet = make_pairing_random(&crypto::Nonce(pairing_data.local_nonce))?;
        ops.try_send_packet(packet)?;

        // STK = s1(TK, Srand, Mrand), masked to the negotiated key size
        let stk = crypto::s1(pairing_data.tk, pairing_data.local_nonce, pairing_data.peer_nonce);
        pairing_data.stk = LongTermKey(stk).mask(pairing_data.negotiated_key_size());

        // Encryption is started by the central; the controller fetches the
        // STK through the long term key request.
        let bond = ops.try_enable_encryption(
            &pairing_data.stk,
            pairing_data.pairing_method.security_level(),
            false,
            0,
            [0; 8],
        )?;
        pairing_data.bond_information = Some(bond);

        Ok(Step::WaitingLinkEncrypted)
    }

    fn handle_key_distribution(command: Command, payload: &[u8], pairing_data: &mut PairingData) -> Result<(), Error> {
        match command {
            Command::EncryptionInformation => {
                let ltk = LongTermKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                pairing_data.peer_long_term_key = ltk;
                trace!("[smp legacy] Received LTK from central");
            }
            Command::CentralIdentification => {
                // The central's EDIV/Rand are not stored in the bond, which
                // retains our own LTK/EDIV/Rand for re-encryption.
                trace!("[smp legacy] Received EDIV/Rand from central");
            }
            Command::IdentityInformation => {
                let irk = IdentityResolvingKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.identity.irk = Some(irk);
                }
                trace!("[smp legacy] Received IRK");
            }
            Command::IdentityAddressInformation => {
                let address = decode_identity_address(payload)?;
                pairing_data.peer_address = address;
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.identity.bd_addr = address.addr;
                }
                trace!("[smp legacy] Received identity address {:?}", address.addr);
            }
            Command::SigningInformation => {
                let csrk = SigningKey::from_le_bytes(payload.try_into().map_err(|_| Error::InvalidValue)?);
                if let Some(ref mut bond) = pairing_data.bond_information {
                    bond.csrk = Some(csrk);
                }
                trace!("[smp legacy] Received CSRK");
            }
            _ => return Err(Error::InvalidState),
        }
        Ok(())
    }
}
