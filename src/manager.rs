//! Security manager engine: session arena, bond store, device configuration
//! and the application facing API.
//!
//! The engine owns at most one pairing session per connection handle. All
//! entry points are meant to be called from the host's single event loop;
//! interior mutability is `RefCell` based and never held across an await.

use core::cell::RefCell;
use core::future::{poll_fn, Future};
use core::ops::DerefMut;

use bt_hci::param::{ConnHandle, LeConnRole};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Instant, TimeoutError, WithTimeout};
use heapless::Vec;
use rand_chacha::ChaCha12Rng;
use rand_core::SeedableRng;

use crate::crypto::{IdentityResolvingKey, LongTermKey, SigningKey};
use crate::oob::{LocalOobData, OobContext, ScOobData};
use crate::pairing::{Event, Pairing, PairingOps};
use crate::pdu::Pdu;
use crate::types::{
    AuthReq, BondingFlag, Command, KeyDistributionFlags, PassKey, Reason, SecurityLevel,
    L2CAP_CID_LE_U_SECURITY_MANAGER, TIMEOUT_DISABLE,
};
use crate::{Address, Error, Identity, IoCapabilities, PacketPool};

/// Work items the host must act on, drained through
/// [`SecurityManager::poll_events`].
pub enum SecurityEventData {
    /// Reply to a long term key request from the controller.
    SendLongTermKey(ConnHandle, Option<LongTermKey>),
    /// Start link encryption with the given bond's key material.
    EnableEncryption(ConnHandle, BondInformation),
    /// A pairing timer changed; re-evaluate the poll deadline.
    TimerChange,
}

/// Events delivered to the application for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityEvent {
    /// Show this passkey to the user; the peer will type it.
    PassKeyDisplay(PassKey),
    /// Ask the user to confirm that both devices show this value.
    PassKeyConfirm(PassKey),
    /// Ask the user to type the passkey shown on the peer.
    PassKeyInput,
    /// Pairing finished with the given security level; `bond` is present
    /// when both sides requested bonding.
    PairingComplete {
        /// Negotiated security level.
        security_level: SecurityLevel,
        /// Bond information when bonding was negotiated.
        bond: Option<BondInformation>,
    },
    /// Pairing failed.
    PairingFailed(Error),
    /// A previously stored bond no longer matches the peer.
    BondLost,
}

/// Bond information
#[derive(Clone, Debug, PartialEq)]
pub struct BondInformation {
    /// Peer identity.
    pub identity: Identity,
    /// Long Term Key (LTK).
    pub ltk: LongTermKey,
    /// Security level the key was created with.
    pub security_level: SecurityLevel,
    /// Whether the pairing included bonding.
    pub is_bonded: bool,
    /// Encrypted diversifier (legacy pairing, zero otherwise).
    pub ediv: u16,
    /// Random number (legacy pairing, zero otherwise).
    pub rand: [u8; 8],
    /// Peer signature key, if distributed.
    pub csrk: Option<SigningKey>,
}

impl core::fmt::Display for BondInformation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Identity {:?} LTK {}", self.identity, self.ltk)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BondInformation {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Identity {:?} LTK {}", self.identity, self.ltk);
    }
}

/// Transport and event delivery the host provides to the engine.
pub trait SecurityOps<P: PacketPool> {
    /// Transmit a security manager PDU on the given connection.
    fn try_send_pdu(&mut self, handle: ConnHandle, pdu: Pdu<P::Packet>) -> Result<(), Error>;
    /// Deliver a security event to the application.
    fn try_send_event(&mut self, handle: ConnHandle, event: SecurityEvent) -> Result<(), Error>;
}

/// Packet structure for sending security manager protocol (SMP) commands
pub struct TxPacket<P: PacketPool> {
    /// Underlying packet
    packet: P::Packet,
    /// Command to send
    pub(crate) command: Command,
}

impl<P: PacketPool> TxPacket<P> {
    /// Size of L2CAP header and command
    const HEADER_SIZE: usize = 5;

    /// Frame a command into a freshly allocated packet
    pub(crate) fn new(mut packet: P::Packet, command: Command) -> Result<Self, Error> {
        let packet_data = packet.as_mut();
        let smp_size = command.payload_size() + 1;
        packet_data[..2].copy_from_slice(&smp_size.to_le_bytes());
        packet_data[2..4].copy_from_slice(&L2CAP_CID_LE_U_SECURITY_MANAGER.to_le_bytes());
        packet_data[4] = command.into();
        Ok(Self { packet, command })
    }

    /// Packet command
    pub(crate) fn command(&self) -> Command {
        self.command
    }

    /// Packet payload
    pub(crate) fn payload(&self) -> &[u8] {
        &self.packet.as_ref()[Self::HEADER_SIZE..Self::HEADER_SIZE + usize::from(self.command.payload_size())]
    }

    /// Packet mutable payload
    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.packet.as_mut()[Self::HEADER_SIZE..Self::HEADER_SIZE + usize::from(self.command.payload_size())]
    }

    /// Full frame size including the L2CAP header
    pub(crate) fn total_size(&self) -> usize {
        usize::from(self.command.payload_size()) + Self::HEADER_SIZE
    }

    /// Create a PDU from the packet
    pub(crate) fn into_pdu(self) -> Pdu<P::Packet> {
        let len = self.total_size();
        Pdu::new(self.packet, len)
    }
}

/// Security manager configuration and bond storage
struct SecurityManagerData<const BOND_COUNT: usize> {
    /// Local device address
    local_address: Option<Address>,
    /// Identity address distributed during bonding, local address if unset
    identity_address: Option<Address>,
    /// Local identity resolving key
    irk: Option<IdentityResolvingKey>,
    /// Local connection signature resolving key
    csrk: Option<SigningKey>,
    /// Counter for locally generated signatures
    sign_counter: u32,
    /// Current bonds with other devices
    bond: Vec<BondInformation, BOND_COUNT>,
    /// Random generator seeded
    random_generator_seeded: bool,
    /// Reject peers that cannot do secure connections pairing
    secure_connections_only: bool,
    /// Request bonding when pairing
    bondable: bool,
}

impl<const BOND_COUNT: usize> SecurityManagerData<BOND_COUNT> {
    fn new() -> Self {
        Self {
            local_address: None,
            identity_address: None,
            irk: None,
            csrk: None,
            sign_counter: 0,
            bond: Vec::new(),
            random_generator_seeded: false,
            secure_connections_only: false,
            bondable: true,
        }
    }
}

/// One connection the security manager knows about.
struct ConnectionEntry {
    handle: ConnHandle,
    role: LeConnRole,
    peer_address: Address,
    peer_oob: Option<ScOobData>,
    pairing: Option<Pairing>,
}

/// Security manager engine.
///
/// `CONNECTIONS` bounds the number of simultaneously tracked links,
/// `BOND_COUNT` the number of stored bonds.
pub struct SecurityManager<const CONNECTIONS: usize, const BOND_COUNT: usize> {
    /// Random generator
    rng: RefCell<ChaCha12Rng>,
    /// Configuration and bonds
    state: RefCell<SecurityManagerData<BOND_COUNT>>,
    /// Tracked connections and their pairing sessions
    connections: RefCell<Vec<ConnectionEntry, CONNECTIONS>>,
    /// Out of band key material for the next OOB pairing
    oob_data: RefCell<Option<LocalOobData>>,
    /// Work items for the host
    events: Channel<NoopRawMutex, SecurityEventData, 4>,
    /// Io capabilities
    io_capabilities: IoCapabilities,
}

impl<const CONNECTIONS: usize, const BOND_COUNT: usize> SecurityManager<CONNECTIONS, BOND_COUNT> {
    /// Create a new SecurityManager
    pub fn new(io_capabilities: IoCapabilities) -> Self {
        let random_seed = [0u8; 32];
        Self {
            rng: RefCell::new(ChaCha12Rng::from_seed(random_seed)),
            state: RefCell::new(SecurityManagerData::new()),
            connections: RefCell::new(Vec::new()),
            oob_data: RefCell::new(None),
            events: Channel::new(),
            io_capabilities,
        }
    }

    /// Seed the random generator. Must be called with entropy from the
    /// controller or platform before any pairing is started.
    pub fn set_random_generator_seed(&self, random_seed: [u8; 32]) {
        self.rng.replace(ChaCha12Rng::from_seed(random_seed));
        self.state.borrow_mut().random_generator_seeded = true;
    }

    /// Set the current local address
    pub fn set_local_address(&self, address: Address) {
        self.state.borrow_mut().local_address = Some(address);
    }

    /// Set the local identity resolving key
    pub fn set_irk(&self, irk: IdentityResolvingKey) {
        self.state.borrow_mut().irk = Some(irk);
    }

    /// Set the identity address distributed during bonding
    pub fn set_identity_address(&self, address: Address) {
        self.state.borrow_mut().identity_address = Some(address);
    }

    /// Set the local signing key (CSRK)
    pub fn set_signing_key(&self, csrk: SigningKey) {
        self.state.borrow_mut().csrk = Some(csrk);
    }

    /// Request bonding in future pairings
    pub fn set_bondable(&self, bondable: bool) {
        self.state.borrow_mut().bondable = bondable;
    }

    /// Reject peers that cannot do secure connections pairing
    pub fn set_secure_connections_only(&self, enabled: bool) {
        self.state.borrow_mut().secure_connections_only = enabled;
    }

    /// Has the random generator been seeded?
    pub fn random_generator_seeded(&self) -> bool {
        self.state.borrow().random_generator_seeded
    }

    /// Add a bonded device
    pub fn add_bond_information(&self, bond_information: BondInformation) -> Result<(), Error> {
        trace!("[security manager] Add bond for {:?}", bond_information.identity);
        let index = self
            .state
            .borrow()
            .bond
            .iter()
            .position(|bond| bond_information.identity.match_identity(&bond.identity));
        match index {
            Some(index) => {
                // Replace existing bond if it exists
                self.state.borrow_mut().bond[index] = bond_information;
                Ok(())
            }
            None => self
                .state
                .borrow_mut()
                .bond
                .push(bond_information)
                .map_err(|_| Error::OutOfMemory),
        }
    }

    /// Remove a bonded device
    pub fn remove_bond_information(&self, identity: Identity) -> Result<(), Error> {
        trace!("[security manager] Remove bond for {:?}", identity);
        let index = self
            .state
            .borrow()
            .bond
            .iter()
            .position(|bond| bond.identity.match_identity(&identity));
        match index {
            Some(index) => {
                self.state.borrow_mut().bond.remove(index);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Get bonded devices
    pub fn get_bond_information(&self) -> Vec<BondInformation, BOND_COUNT> {
        Vec::from_slice(self.state.borrow().bond.as_slice()).unwrap()
    }

    /// Get the long term key for a peer
    pub fn get_peer_long_term_key(&self, identity: &Identity) -> Option<LongTermKey> {
        trace!("[security manager] Find long term key for {:?}", identity);
        self.state.borrow().bond.iter().find_map(|bond| {
            if bond.identity.match_identity(identity) {
                Some(bond.ltk)
            } else {
                None
            }
        })
    }

    /// A new connection was established.
    pub fn handle_connected(&self, handle: ConnHandle, role: LeConnRole, peer_address: Address) -> Result<(), Error> {
        let mut connections = self.connections.borrow_mut();
        if connections.iter().any(|c| c.handle == handle) {
            return Err(Error::InvalidState);
        }
        connections
            .push(ConnectionEntry {
                handle,
                role,
                peer_address,
                peer_oob: None,
                pairing: None,
            })
            .map_err(|_| Error::OutOfMemory)
    }

    /// A connection dropped; any in-flight pairing is discarded and, when an
    /// identity is given, the bond for it is forgotten.
    pub fn handle_disconnected(&self, handle: ConnHandle, identity: Option<Identity>) -> Result<(), Error> {
        let mut connections = self.connections.borrow_mut();
        connections.retain(|c| c.handle != handle);
        if let Some(identity) = identity {
            self.state.borrow_mut().bond.retain(|x| x.identity != identity);
        }
        Ok(())
    }

    /// Inject out of band data received from the peer for the next pairing
    /// on this connection.
    pub fn set_peer_oob_data(&self, handle: ConnHandle, data: ScOobData) -> Result<(), Error> {
        let mut connections = self.connections.borrow_mut();
        let entry = connections
            .iter_mut()
            .find(|c| c.handle == handle)
            .ok_or(Error::NotFound)?;
        entry.peer_oob = Some(data);
        Ok(())
    }

    /// Generate out of band data for secure connections pairing. The key
    /// pair is kept and used by the next OOB pairing. Rejected while any
    /// pairing is in progress.
    pub fn generate_sc_oob_data(&self) -> Result<ScOobData, Error> {
        if !self.random_generator_seeded() {
            return Err(Error::InvalidState);
        }
        if self.pairing_in_progress() {
            return Err(Error::InvalidState);
        }
        let address = self.state.borrow().local_address.ok_or(Error::InvalidState)?;
        let local = LocalOobData::generate(self.rng.borrow_mut().deref_mut());
        let shared = local.shared_data(address);
        self.oob_data.replace(Some(local));
        Ok(shared)
    }

    /// Generate a resolvable private address from the local IRK.
    pub fn generate_rpa(&self) -> Result<Address, Error> {
        let irk = self.state.borrow().irk.ok_or(Error::InvalidState)?;
        let addr = irk.generate_resolvable_address(self.rng.borrow_mut().deref_mut());
        Ok(Address {
            kind: bt_hci::param::AddrKind::RANDOM,
            addr,
        })
    }

    /// Resolve a resolvable private address against the stored bonds.
    pub fn resolve_rpa(&self, address: &bt_hci::param::BdAddr) -> Option<Identity> {
        self.state
            .borrow()
            .bond
            .iter()
            .find(|bond| bond.identity.resolve(address))
            .map(|bond| bond.identity)
    }

    /// Sign a message with the local CSRK. Returns the 12-octet signature
    /// and advances the sign counter.
    pub fn sign_data(&self, message: &[u8]) -> Result<[u8; 12], Error> {
        let mut state = self.state.borrow_mut();
        let csrk = state.csrk.ok_or(Error::InvalidState)?;
        let counter = state.sign_counter;
        state.sign_counter = state.sign_counter.wrapping_add(1);
        Ok(csrk.sign(message, counter))
    }

    fn pairing_in_progress(&self) -> bool {
        self.connections
            .borrow()
            .iter()
            .any(|c| c.pairing.as_ref().is_some_and(|p| p.result().is_none()))
    }

    /// Security level reached by the pairing in flight on this connection.
    pub fn security_level(&self, handle: ConnHandle) -> SecurityLevel {
        self.connections
            .borrow()
            .iter()
            .find(|c| c.handle == handle)
            .and_then(|c| c.pairing.as_ref())
            .map(|p| p.security_level())
            .unwrap_or(SecurityLevel::NoEncryption)
    }

    /// Initiate pairing on a connection. As central this sends a pairing
    /// request (or re-encrypts from a stored bond); as peripheral it sends a
    /// security request.
    pub fn initiate<P: PacketPool, OPS: SecurityOps<P>>(
        &self,
        handle: ConnHandle,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if !self.random_generator_seeded() {
            warn!("[security manager] Random generator is not seeded");
            return Err(Error::InvalidState);
        }
        let (role, peer_address, oob) = {
            let connections = self.connections.borrow();
            let entry = connections.iter().find(|c| c.handle == handle).ok_or(Error::NotFound)?;
            if entry.pairing.as_ref().is_some_and(|p| p.result().is_none()) {
                return Err(Error::InvalidState);
            }
            (entry.role, entry.peer_address, self.oob_context(entry))
        };
        let local_address = self.state.borrow().local_address.ok_or(Error::InvalidValue)?;

        let mut pairing_ops = PairingOpsImpl {
            security_manager: self,
            ops,
            conn_handle: handle,
            role,
            peer_address,
        };
        let pairing = if role == LeConnRole::Peripheral {
            Pairing::initiate_peripheral(local_address, peer_address, &mut pairing_ops, self.io_capabilities, oob)?
        } else {
            Pairing::initiate_central(local_address, peer_address, &mut pairing_ops, self.io_capabilities, oob)?
        };

        let mut connections = self.connections.borrow_mut();
        let entry = connections
            .iter_mut()
            .find(|c| c.handle == handle)
            .ok_or(Error::NotFound)?;
        entry.pairing = Some(pairing);
        let _ = self.try_send_event(SecurityEventData::TimerChange);
        Ok(())
    }

    /// Abort an in-flight pairing. The peer is told the pairing failed with
    /// an unspecified reason.
    pub fn cancel<P: PacketPool, OPS: SecurityOps<P>>(&self, handle: ConnHandle, ops: &mut OPS) -> Result<(), Error> {
        {
            let mut connections = self.connections.borrow_mut();
            let entry = connections
                .iter_mut()
                .find(|c| c.handle == handle)
                .ok_or(Error::NotFound)?;
            if entry.pairing.take().is_none() {
                return Err(Error::NotFound);
            }
        }
        let mut packet = self.prepare_packet::<P>(Command::PairingFailed)?;
        packet.payload_mut()[0] = u8::from(Reason::UnspecifiedReason);
        ops.try_send_pdu(handle, packet.into_pdu())?;
        ops.try_send_event(
            handle,
            SecurityEvent::PairingFailed(Error::Security(Reason::UnspecifiedReason)),
        )?;
        let _ = self.try_send_event(SecurityEventData::TimerChange);
        Ok(())
    }

    fn oob_context(&self, entry: &ConnectionEntry) -> OobContext {
        OobContext {
            local: self.oob_data.borrow().clone(),
            peer: entry.peer_oob,
        }
    }

    /// Handle a security manager PDU received on a connection.
    pub fn handle_l2cap_command<P: PacketPool, OPS: SecurityOps<P>>(
        &self,
        handle: ConnHandle,
        pdu: Pdu<P::Packet>,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let mut buffer = [0u8; 72];
        let command = crate::pairing::util::CommandAndPayload::try_parse::<P>(&pdu, &mut buffer);
        let result = match command {
            Ok(command) => self.dispatch_command::<P, OPS>(handle, command.command, command.payload, ops),
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                let connections = self.connections.borrow();
                if let Some(entry) = connections.iter().find(|c| c.handle == handle) {
                    if let Some(pairing) = entry.pairing.as_ref() {
                        pairing.reset_timeout();
                        let _ = self.try_send_event(SecurityEventData::TimerChange);
                    }
                }
            }
            Err(error) => {
                if let Err(e) = self.handle_security_error::<P, OPS>(handle, &result, ops) {
                    error!("[security manager] Failed sending pairing failed message! {:?}", e);
                }
                if self.session_failed(handle) {
                    let _ = ops.try_send_event(handle, SecurityEvent::PairingFailed(error.clone()));
                }
            }
        }
        self.clear_finished(handle);
        result
    }

    fn dispatch_command<P: PacketPool, OPS: SecurityOps<P>>(
        &self,
        handle: ConnHandle,
        command: Command,
        payload: &[u8],
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let role = {
            let connections = self.connections.borrow();
            let entry = connections.iter().find(|c| c.handle == handle).ok_or(Error::NotFound)?;
            entry.role
        };

        // The peer gave up; tear the session down without a reply.
        if command == Command::PairingFailed {
            let reason = Reason::try_from(payload[0]).unwrap_or(Reason::UnspecifiedReason);
            error!("[security manager] Peer reported pairing failed: {}", reason);
            let had_session = {
                let mut connections = self.connections.borrow_mut();
                let entry = connections
                    .iter_mut()
                    .find(|c| c.handle == handle)
                    .ok_or(Error::NotFound)?;
                entry.pairing.take().is_some()
            };
            if had_session {
                ops.try_send_event(handle, SecurityEvent::PairingFailed(Error::Security(reason)))?;
                let _ = self.try_send_event(SecurityEventData::TimerChange);
            }
            return Ok(());
        }

        // A new pairing request while one is already running is a protocol
        // violation; refuse it without touching the active session. A
        // responder that sent a security request is still waiting for one.
        if self.session_active(handle) {
            if command == Command::PairingRequest && !self.session_expects_pairing_request(handle) {
                return Err(Error::Security(Reason::RepeatedAttempts));
            }
        } else {
            self.create_session_for(handle, role, command, payload)?;
        }

        // A central that requested secure connections downgrades to legacy
        // pairing when the response says the peer cannot do it; likewise a
        // responder that asked with a security request downgrades when the
        // pairing request it provoked is legacy only.
        let peer_is_legacy = matches!(command, Command::PairingRequest | Command::PairingResponse)
            && !AuthReq::from(payload[2]).secure_connection();
        if peer_is_legacy {
            if self.state.borrow().secure_connections_only {
                return Err(Error::Security(Reason::AuthenticationRequirements));
            }
            match command {
                Command::PairingResponse => self.switch_to_legacy(handle)?,
                Command::PairingRequest => self.switch_to_legacy_peripheral(handle)?,
                _ => {}
            }
        }

        let connections = self.connections.borrow();
        let entry = connections.iter().find(|c| c.handle == handle).ok_or(Error::NotFound)?;
        let pairing = entry.pairing.as_ref().ok_or(Error::InvalidState)?;
        if pairing.is_central() != (role == LeConnRole::Central) {
            return Err(Error::InvalidState);
        }
        let mut pairing_ops = PairingOpsImpl {
            security_manager: self,
            ops,
            conn_handle: handle,
            role,
            // The session tracks the identity address once it is exchanged
            peer_address: pairing.peer_address(),
        };
        let mut rng = self.rng.borrow_mut();
        pairing.handle_l2cap_command(command, payload, &mut pairing_ops, rng.deref_mut())
    }

    fn session_active(&self, handle: ConnHandle) -> bool {
        self.connections
            .borrow()
            .iter()
            .find(|c| c.handle == handle)
            .and_then(|c| c.pairing.as_ref())
            .is_some_and(|p| p.result().is_none())
    }

    fn session_expects_pairing_request(&self, handle: ConnHandle) -> bool {
        self.connections
            .borrow()
            .iter()
            .find(|c| c.handle == handle)
            .and_then(|c| c.pairing.as_ref())
            .is_some_and(|p| p.expects_pairing_request())
    }

    fn session_failed(&self, handle: ConnHandle) -> bool {
        self.connections
            .borrow()
            .iter()
            .find(|c| c.handle == handle)
            .and_then(|c| c.pairing.as_ref())
            .is_some_and(|p| matches!(p.result(), Some(Err(_))))
    }

    /// Create the pairing session a first peer command implies: a pairing
    /// request creates a responder, a security request an initiator.
    fn create_session_for(
        &self,
        handle: ConnHandle,
        role: LeConnRole,
        command: Command,
        payload: &[u8],
    ) -> Result<(), Error> {
        let local_address = self.state.borrow().local_address.ok_or(Error::InvalidValue)?;
        let mut connections = self.connections.borrow_mut();
        let entry = connections
            .iter_mut()
            .find(|c| c.handle == handle)
            .ok_or(Error::NotFound)?;
        let oob = self.oob_context(entry);

        let pairing = match (role, command) {
            (LeConnRole::Peripheral, Command::PairingRequest) => {
                // AuthReq decides between secure connections and legacy
                let secure = AuthReq::from(payload[2]).secure_connection();
                if secure {
                    Pairing::new_peripheral(local_address, entry.peer_address, self.io_capabilities, oob)
                } else if self.state.borrow().secure_connections_only {
                    return Err(Error::Security(Reason::AuthenticationRequirements));
                } else {
                    Pairing::new_legacy_peripheral(local_address, entry.peer_address, self.io_capabilities)
                }
            }
            (LeConnRole::Central, Command::SecurityRequest) => {
                Pairing::new_central(local_address, entry.peer_address, self.io_capabilities, oob)
            }
            _ => return Err(Error::InvalidState),
        };
        entry.pairing = Some(pairing);
        Ok(())
    }

    fn switch_to_legacy(&self, handle: ConnHandle) -> Result<(), Error> {
        let mut connections = self.connections.borrow_mut();
        let entry = connections
            .iter_mut()
            .find(|c| c.handle == handle)
            .ok_or(Error::NotFound)?;
        // Only an SC central can downgrade; anything else lets the session
        // fail closed on the unexpected pairing response.
        if matches!(entry.pairing, Some(Pairing::Central(_))) {
            let pairing = entry.pairing.take().ok_or(Error::InvalidState)?;
            entry.pairing = Some(pairing.switch_to_legacy_central()?);
        }
        Ok(())
    }

    /// An SC responder still waiting for the pairing request it asked for is
    /// recreated as a legacy responder; it has no protocol state to carry.
    fn switch_to_legacy_peripheral(&self, handle: ConnHandle) -> Result<(), Error> {
        let local_address = self.state.borrow().local_address.ok_or(Error::InvalidValue)?;
        let mut connections = self.connections.borrow_mut();
        let entry = connections
            .iter_mut()
            .find(|c| c.handle == handle)
            .ok_or(Error::NotFound)?;
        if entry
            .pairing
            .as_ref()
            .is_some_and(|p| matches!(p, Pairing::Peripheral(_)) && p.expects_pairing_request())
        {
            entry.pairing = Some(Pairing::new_legacy_peripheral(
                local_address,
                entry.peer_address,
                self.io_capabilities,
            ));
        }
        Ok(())
    }

    /// Remove a session that reached a terminal state; its result has
    /// already been reported.
    fn clear_finished(&self, handle: ConnHandle) {
        let mut connections = self.connections.borrow_mut();
        if let Some(entry) = connections.iter_mut().find(|c| c.handle == handle) {
            if entry.pairing.as_ref().is_some_and(|p| p.result().is_some()) {
                entry.pairing = None;
            }
        }
    }

    fn handle_security_error<P: PacketPool, OPS: SecurityOps<P>>(
        &self,
        handle: ConnHandle,
        result: &Result<(), Error>,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        if let Err(error) = result {
            let reason = if let Error::Security(security_error) = error {
                *security_error
            } else {
                Reason::UnspecifiedReason
            };

            error!("[security manager] Handling of command failed {:?}", error);

            // Cease sending security manager messages on timeout
            if *error != Error::Timeout {
                let mut packet = self.prepare_packet::<P>(Command::PairingFailed)?;
                packet.payload_mut()[0] = u8::from(reason);
                ops.try_send_pdu(handle, packet.into_pdu())?;
            }
        }
        Ok(())
    }

    /// Handle an encryption change event from the controller.
    pub fn handle_encryption_changed<P: PacketPool, OPS: SecurityOps<P>>(
        &self,
        handle: ConnHandle,
        enabled: bool,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        self.handle_event::<P, OPS>(handle, Event::LinkEncryptedResult(enabled), ops)
    }

    /// Handle a long term key request from the controller: an in-flight
    /// session supplies its STK/LTK, otherwise the bond store is consulted.
    /// The key is also queued as a [`SecurityEventData::SendLongTermKey`]
    /// work item.
    pub fn handle_long_term_key_request(&self, handle: ConnHandle) -> Option<LongTermKey> {
        let key = {
            let connections = self.connections.borrow();
            let entry = connections.iter().find(|c| c.handle == handle)?;
            entry
                .pairing
                .as_ref()
                .and_then(|p| p.link_key())
                .or_else(|| {
                    let identity = Identity {
                        bd_addr: entry.peer_address.addr,
                        irk: None,
                    };
                    self.get_peer_long_term_key(&identity)
                })
        };
        let _ = self.try_send_event(SecurityEventData::SendLongTermKey(handle, key));
        key
    }

    /// The user typed a passkey.
    pub fn pass_key_input<P: PacketPool, OPS: SecurityOps<P>>(
        &self,
        handle: ConnHandle,
        input: u32,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        self.handle_event::<P, OPS>(handle, Event::PassKeyInput(input), ops)
    }

    /// The user confirmed or rejected the displayed comparison value.
    pub fn pass_key_confirm<P: PacketPool, OPS: SecurityOps<P>>(
        &self,
        handle: ConnHandle,
        confirmed: bool,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let pairing_event = match confirmed {
            true => Event::PassKeyConfirm,
            false => Event::PassKeyCancel,
        };
        self.handle_event::<P, OPS>(handle, pairing_event, ops)
    }

    fn handle_event<P: PacketPool, OPS: SecurityOps<P>>(
        &self,
        handle: ConnHandle,
        pairing_event: Event,
        ops: &mut OPS,
    ) -> Result<(), Error> {
        let result = {
            let connections = self.connections.borrow();
            let entry = connections.iter().find(|c| c.handle == handle).ok_or(Error::NotFound)?;
            let Some(pairing) = entry.pairing.as_ref() else {
                // Encryption can change outside a pairing exchange, for
                // example on re-encryption from a stored bond.
                return match pairing_event {
                    Event::LinkEncryptedResult(_) => Ok(()),
                    _ => Err(Error::InvalidState),
                };
            };
            let mut pairing_ops = PairingOpsImpl {
                security_manager: self,
                ops,
                conn_handle: handle,
                role: entry.role,
                peer_address: pairing.peer_address(),
            };
            let mut rng = self.rng.borrow_mut();
            let res = pairing.handle_event(pairing_event, &mut pairing_ops, rng.deref_mut());
            if res.is_ok() {
                pairing.reset_timeout();
                let _ = self.try_send_event(SecurityEventData::TimerChange);
            }
            res
        };
        if result.is_err() {
            if let Err(e) = self.handle_security_error::<P, OPS>(handle, &result, ops) {
                error!("[security manager] Failed sending pairing failed message! {:?}", e);
            }
        }
        self.clear_finished(handle);
        result
    }

    /// Fail every session whose pairing timeout has expired. Call when
    /// [`SecurityManager::poll_events`] reports a timeout.
    pub fn handle_timeout<P: PacketPool, OPS: SecurityOps<P>>(&self, ops: &mut OPS) {
        let now = Instant::now();
        let mut expired: Vec<ConnHandle, CONNECTIONS> = Vec::new();
        {
            let connections = self.connections.borrow();
            for entry in connections.iter() {
                if let Some(pairing) = entry.pairing.as_ref() {
                    if pairing.result().is_none() && pairing.timeout_at() <= now {
                        pairing.mark_timeout();
                        let _ = expired.push(entry.handle);
                    }
                }
            }
        }
        for handle in expired {
            warn!("[security manager] Pairing timed out on {:?}", handle);
            let _ = ops.try_send_event(handle, SecurityEvent::PairingFailed(Error::Timeout));
            self.clear_finished(handle);
        }
    }

    /// Prepare a packet for sending
    fn prepare_packet<P: PacketPool>(&self, command: Command) -> Result<TxPacket<P>, Error> {
        let packet = P::allocate().ok_or(Error::OutOfMemory)?;
        TxPacket::new(packet, command)
    }

    /// Queue a work item for the host
    fn try_send_event(&self, event: SecurityEventData) -> Result<(), Error> {
        // Timer changes only wake the poller; anything already queued does
        // that too, so they never need to stack up in the channel.
        if matches!(event, SecurityEventData::TimerChange) && !self.events.is_empty() {
            return Ok(());
        }
        self.events.try_send(event).map_err(|_| Error::OutOfMemory)
    }

    /// Take a pending work item without waiting, for hosts that poll.
    pub fn try_take_event(&self) -> Option<SecurityEventData> {
        self.events.try_receive().ok()
    }

    /// Poll for security manager work. Resolves with a work item, or with
    /// `TimeoutError` when the earliest pairing deadline passes, in which
    /// case the caller runs [`SecurityManager::handle_timeout`].
    pub fn poll_events(&self) -> impl Future<Output = Result<SecurityEventData, TimeoutError>> + use<'_, CONNECTIONS, BOND_COUNT> {
        let deadline = {
            let connections = self.connections.borrow();
            connections
                .iter()
                .filter_map(|c| c.pairing.as_ref().map(|p| p.timeout_at()))
                .min()
                .unwrap_or(Instant::now() + TIMEOUT_DISABLE)
        };
        // try to pop an event from the channel
        poll_fn(|cx| self.events.poll_receive(cx)).with_deadline(deadline)
    }

    fn find_bond_for(&self, peer_address: &Address) -> Option<BondInformation> {
        self.state
            .borrow()
            .bond
            .iter()
            .find(|bond| bond.identity.bd_addr == peer_address.addr || bond.identity.resolve(&peer_address.addr))
            .cloned()
    }
}

struct PairingOpsImpl<'sm, 'o, const C: usize, const B: usize, OPS> {
    security_manager: &'sm SecurityManager<C, B>,
    ops: &'o mut OPS,
    conn_handle: ConnHandle,
    role: LeConnRole,
    peer_address: Address,
}

impl<'sm, 'o, const C: usize, const B: usize, P: PacketPool, OPS: SecurityOps<P>> PairingOps<P>
    for PairingOpsImpl<'sm, 'o, C, B, OPS>
{
    fn try_send_packet(&mut self, packet: TxPacket<P>) -> Result<(), Error> {
        let len = packet.total_size();
        trace!("[security manager] Send {} {}", packet.command, len);
        self.ops.try_send_pdu(self.conn_handle, packet.into_pdu())?;
        let _ = self.security_manager.try_send_event(SecurityEventData::TimerChange);
        Ok(())
    }

    fn find_bond(&self) -> Option<BondInformation> {
        self.security_manager.find_bond_for(&self.peer_address)
    }

    fn try_enable_bonded_encryption(&mut self) -> Result<Option<BondInformation>, Error> {
        let Some(bond) = self.find_bond() else {
            return Ok(None);
        };
        if self.role == LeConnRole::Central {
            // The host issues the HCI encryption start with this key
            self.security_manager
                .try_send_event(SecurityEventData::EnableEncryption(self.conn_handle, bond.clone()))?;
        }
        Ok(Some(bond))
    }

    fn try_enable_encryption(
        &mut self,
        ltk: &LongTermKey,
        security_level: SecurityLevel,
        is_bonded: bool,
        ediv: u16,
        rand: [u8; 8],
    ) -> Result<BondInformation, Error> {
        info!("[security manager] Enabling encryption for {:?}", self.peer_address);
        let bond = BondInformation {
            identity: Identity {
                bd_addr: self.peer_address.addr,
                irk: None,
            },
            ltk: *ltk,
            security_level,
            is_bonded,
            ediv,
            rand,
            csrk: None,
        };
        if self.role == LeConnRole::Central {
            self.security_manager
                .try_send_event(SecurityEventData::EnableEncryption(self.conn_handle, bond.clone()))?;
        }
        // As peripheral the central starts encryption and the controller
        // fetches the key through the long term key request.
        Ok(bond)
    }

    fn try_update_bond_information(&mut self, bond: &BondInformation) -> Result<(), Error> {
        self.security_manager.add_bond_information(bond.clone())
    }

    fn connection_handle(&mut self) -> ConnHandle {
        self.conn_handle
    }

    fn try_send_connection_event(&mut self, event: SecurityEvent) -> Result<(), Error> {
        let timer_changed = matches!(
            event,
            SecurityEvent::PairingComplete { .. } | SecurityEvent::PairingFailed(_)
        );
        self.ops.try_send_event(self.conn_handle, event)?;
        if timer_changed {
            let _ = self.security_manager.try_send_event(SecurityEventData::TimerChange);
        }
        Ok(())
    }

    fn bonding_flag(&self) -> BondingFlag {
        if self.security_manager.state.borrow().bondable {
            BondingFlag::Bonding
        } else {
            BondingFlag::NoBonding
        }
    }

    fn local_key_distribution(&self) -> KeyDistributionFlags {
        let state = self.security_manager.state.borrow();
        KeyDistributionFlags::new(true, state.irk.is_some(), state.csrk.is_some())
    }

    fn local_irk(&self) -> Option<IdentityResolvingKey> {
        self.security_manager.state.borrow().irk
    }

    fn local_identity_address(&self) -> Address {
        let state = self.security_manager.state.borrow();
        state
            .identity_address
            .or(state.local_address)
            .unwrap_or(Address::public([0; 6]))
    }

    fn local_signing_key(&self) -> Option<SigningKey> {
        self.security_manager.state.borrow().csrk
    }
}
