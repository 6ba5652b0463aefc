use bt_hci::param::AddrKind;

use crate::crypto::{Check, Confirm, IdentityResolvingKey, LongTermKey, Nonce, PublicKey, SigningKey};
use crate::manager::TxPacket;
use crate::pdu::Pdu;
use crate::types::{Command, PairingFeatures, Reason, SecurityLevel, UseOutOfBand};
use crate::{Address, Error, IoCapabilities, PacketPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PassKeyEntryAction {
    Display,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PairingMethod {
    JustWorks,
    NumericComparison,
    PassKeyEntry {
        central: PassKeyEntryAction,
        peripheral: PassKeyEntryAction,
    },
    OutOfBand,
}

impl PairingMethod {
    pub fn security_level(&self) -> SecurityLevel {
        match self {
            PairingMethod::JustWorks => SecurityLevel::Encrypted,
            _ => SecurityLevel::EncryptedAuthenticated,
        }
    }
}

/// Map both sides' IO capabilities to a pairing method
// ([Vol 3] Part H, Section 2.3.5.1, Table 2.8).
fn io_capability_method(central: IoCapabilities, peripheral: IoCapabilities) -> PairingMethod {
    use IoCapabilities::*;
    use PassKeyEntryAction::*;
    match peripheral {
        DisplayOnly => match central {
            KeyboardOnly | KeyboardDisplay => PairingMethod::PassKeyEntry {
                central: Input,
                peripheral: Display,
            },
            _ => PairingMethod::JustWorks,
        },
        DisplayYesNo => match central {
            DisplayYesNo | KeyboardDisplay => PairingMethod::NumericComparison,
            KeyboardOnly => PairingMethod::PassKeyEntry {
                central: Input,
                peripheral: Display,
            },
            _ => PairingMethod::JustWorks,
        },
        KeyboardOnly => match central {
            NoInputNoOutput => PairingMethod::JustWorks,
            KeyboardOnly => PairingMethod::PassKeyEntry {
                central: Input,
                peripheral: Input,
            },
            _ => PairingMethod::PassKeyEntry {
                central: Display,
                peripheral: Input,
            },
        },
        NoInputNoOutput => PairingMethod::JustWorks,
        KeyboardDisplay => match central {
            DisplayOnly => PairingMethod::PassKeyEntry {
                central: Display,
                peripheral: Input,
            },
            KeyboardOnly => PairingMethod::PassKeyEntry {
                central: Input,
                peripheral: Display,
            },
            NoInputNoOutput => PairingMethod::JustWorks,
            _ => PairingMethod::NumericComparison,
        },
    }
}

/// Select the Secure Connections pairing method from both sides' features.
///
/// OOB data takes precedence; without it, if neither side requires MITM
/// protection the method is Just Works regardless of IO capabilities.
pub fn choose_pairing_method(central: PairingFeatures, peripheral: PairingFeatures) -> PairingMethod {
    if matches!(central.use_oob, UseOutOfBand::Present) || matches!(peripheral.use_oob, UseOutOfBand::Present) {
        PairingMethod::OutOfBand
    } else if !central.security_properties.man_in_the_middle() && !peripheral.security_properties.man_in_the_middle() {
        PairingMethod::JustWorks
    } else {
        io_capability_method(central.io_capabilities, peripheral.io_capabilities)
    }
}

/// Select the legacy pairing method from both sides' features.
///
/// Unlike Secure Connections, legacy OOB requires out-of-band data on both
/// sides, and there is no numeric comparison protocol.
pub fn choose_legacy_pairing_method(central: PairingFeatures, peripheral: PairingFeatures) -> PairingMethod {
    if matches!(central.use_oob, UseOutOfBand::Present) && matches!(peripheral.use_oob, UseOutOfBand::Present) {
        PairingMethod::OutOfBand
    } else if !central.security_properties.man_in_the_middle() && !peripheral.security_properties.man_in_the_middle() {
        PairingMethod::JustWorks
    } else {
        match io_capability_method(central.io_capabilities, peripheral.io_capabilities) {
            PairingMethod::NumericComparison => PairingMethod::JustWorks,
            method => method,
        }
    }
}

pub fn prepare_packet<P: PacketPool>(command: Command) -> Result<TxPacket<P>, Error> {
    let packet = P::allocate().ok_or(Error::OutOfMemory)?;
    TxPacket::new(packet, command)
}

pub fn make_pairing_random<P: PacketPool>(nonce: &Nonce) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::PairingRandom)?;
    let response = packet.payload_mut();
    response.copy_from_slice(&nonce.0.to_le_bytes());
    Ok(packet)
}

pub fn make_public_key_packet<P: PacketPool>(public_key: &PublicKey) -> Result<TxPacket<P>, Error> {
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(public_key.x.as_be_bytes());
    y.copy_from_slice(public_key.y.as_be_bytes());
    x.reverse();
    y.reverse();
    let mut packet = prepare_packet(Command::PairingPublicKey)?;

    let response = packet.payload_mut();
    response[..x.len()].copy_from_slice(&x);
    response[x.len()..y.len() + x.len()].copy_from_slice(&y);
    Ok(packet)
}

pub fn make_dhkey_check_packet<P: PacketPool>(check: &Check) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet(Command::PairingDhKeyCheck)?;
    let response = packet.payload_mut();
    response.copy_from_slice(&check.0.to_le_bytes());
    Ok(packet)
}

pub fn make_confirm_packet<P: PacketPool>(confirm: &Confirm) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::PairingConfirm)?;
    let response = packet.payload_mut();
    response.copy_from_slice(&confirm.0.to_le_bytes());
    Ok(packet)
}

pub fn make_encryption_information_packet<P: PacketPool>(ltk: &LongTermKey) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::EncryptionInformation)?;
    let response = packet.payload_mut();
    response.copy_from_slice(&ltk.to_le_bytes());
    Ok(packet)
}

pub fn make_central_identification_packet<P: PacketPool>(ediv: u16, rand: &[u8; 8]) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::CentralIdentification)?;
    let response = packet.payload_mut();
    response[..2].copy_from_slice(&ediv.to_le_bytes());
    response[2..].copy_from_slice(rand);
    Ok(packet)
}

pub fn make_identity_information_packet<P: PacketPool>(irk: &IdentityResolvingKey) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::IdentityInformation)?;
    let response = packet.payload_mut();
    response.copy_from_slice(&irk.to_le_bytes());
    Ok(packet)
}

pub fn make_identity_address_information_packet<P: PacketPool>(address: &Address) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::IdentityAddressInformation)?;
    let response = packet.payload_mut();
    response[0] = if address.kind == AddrKind::PUBLIC { 0 } else { 1 };
    response[1..].copy_from_slice(&address.addr.into_inner());
    Ok(packet)
}

pub fn make_signing_information_packet<P: PacketPool>(csrk: &SigningKey) -> Result<TxPacket<P>, Error> {
    let mut packet = prepare_packet::<P>(Command::SigningInformation)?;
    let response = packet.payload_mut();
    response.copy_from_slice(&csrk.to_le_bytes());
    Ok(packet)
}

#[derive(Debug, Clone)]
pub struct CommandAndPayload<'a> {
    pub command: Command,
    pub payload: &'a [u8],
}

impl<'a> CommandAndPayload<'a> {
    pub fn try_parse<P: PacketPool>(pdu: &Pdu<P::Packet>, buffer: &'a mut [u8]) -> Result<Self, Error> {
        let size = {
            let size = pdu.len().min(buffer.len());
            buffer[..size].copy_from_slice(&pdu.as_ref()[..size]);
            size
        };
        if size < 2 {
            error!("[security manager] Payload size too small {}", size);
            return Err(Error::Security(Reason::InvalidParameters));
        }
        let payload = &buffer[1..size];
        let command = buffer[0];

        let command = match Command::try_from(command) {
            Ok(command) => {
                if usize::from(command.payload_size()) != payload.len() {
                    error!("[security manager] Payload size mismatch for command {}", command);
                    return Err(Error::Security(Reason::InvalidParameters));
                }
                command
            }
            Err(_) => return Err(Error::Security(Reason::CommandNotSupported)),
        };

        Ok(Self { command, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthReq, BondingFlag, KeyDistributionFlags};

    fn features(io: u8, oob: UseOutOfBand, mitm: bool) -> PairingFeatures {
        let mut security_properties = AuthReq::new_legacy(BondingFlag::NoBonding);
        if mitm {
            security_properties = security_properties.with_mitm();
        }
        PairingFeatures {
            io_capabilities: io.try_into().unwrap(),
            use_oob: oob,
            security_properties,
            initiator_key_distribution: KeyDistributionFlags::NONE,
            responder_key_distribution: KeyDistributionFlags::NONE,
            maximum_encryption_key_size: 16,
        }
    }

    #[test]
    fn oob_used() {
        for p_oob in [UseOutOfBand::NotPresent, UseOutOfBand::Present] {
            for c_oob in [UseOutOfBand::NotPresent, UseOutOfBand::Present] {
                for p in 0u8..5 {
                    for c in 0u8..5 {
                        let peripheral = features(p, p_oob, true);
                        let central = features(c, c_oob, true);
                        let either = p_oob == UseOutOfBand::Present || c_oob == UseOutOfBand::Present;
                        let both = p_oob == UseOutOfBand::Present && c_oob == UseOutOfBand::Present;
                        assert_eq!(
                            choose_pairing_method(central, peripheral) == PairingMethod::OutOfBand,
                            either
                        );
                        assert_eq!(
                            choose_legacy_pairing_method(central, peripheral) == PairingMethod::OutOfBand,
                            both
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn no_mitm_is_always_just_works() {
        for p in 0u8..5 {
            for c in 0u8..5 {
                let peripheral = features(p, UseOutOfBand::NotPresent, false);
                let central = features(c, UseOutOfBand::NotPresent, false);
                assert_eq!(choose_pairing_method(central, peripheral), PairingMethod::JustWorks);
                assert_eq!(
                    choose_legacy_pairing_method(central, peripheral),
                    PairingMethod::JustWorks
                );
            }
        }
    }

    /// A display action on one side always pairs with an input action on the
    /// other, never display against display.
    #[test]
    fn pass_key_entry_actions_mirror() {
        for p in 0u8..5 {
            for c in 0u8..5 {
                let peripheral = features(p, UseOutOfBand::NotPresent, true);
                let central = features(c, UseOutOfBand::NotPresent, true);
                for method in [
                    choose_pairing_method(central, peripheral),
                    choose_legacy_pairing_method(central, peripheral),
                ] {
                    if let PairingMethod::PassKeyEntry { central, peripheral } = method {
                        assert!(
                            !(central == PassKeyEntryAction::Display && peripheral == PassKeyEntryAction::Display),
                            "display may not pair with display"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn keyboard_display_against_display_only_is_pass_key_entry() {
        let central = features(IoCapabilities::KeyboardDisplay.into(), UseOutOfBand::NotPresent, true);
        let peripheral = features(IoCapabilities::DisplayOnly.into(), UseOutOfBand::NotPresent, true);
        assert_eq!(
            choose_pairing_method(central, peripheral),
            PairingMethod::PassKeyEntry {
                central: PassKeyEntryAction::Input,
                peripheral: PassKeyEntryAction::Display,
            }
        );
    }

    #[test]
    fn keyboard_display_pairings_follow_the_table() {
        let mk = |io| features(u8::from(io), UseOutOfBand::NotPresent, true);
        assert_eq!(
            choose_pairing_method(mk(IoCapabilities::KeyboardDisplay), mk(IoCapabilities::KeyboardDisplay)),
            PairingMethod::NumericComparison
        );
        assert_eq!(
            choose_pairing_method(mk(IoCapabilities::KeyboardOnly), mk(IoCapabilities::KeyboardDisplay)),
            PairingMethod::PassKeyEntry {
                central: PassKeyEntryAction::Input,
                peripheral: PassKeyEntryAction::Display,
            }
        );
        // Legacy has no numeric comparison protocol
        assert_eq!(
            choose_legacy_pairing_method(mk(IoCapabilities::KeyboardDisplay), mk(IoCapabilities::KeyboardDisplay)),
            PairingMethod::JustWorks
        );
    }
}
