use crate::error::WebAuthnError;
use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};
use std::io::Cursor;

const HEADER_LEN: usize = 37;
const AAGUID_LEN: usize = 16;

/// Flag bits of the authenticator data byte at offset 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatorFlags(pub u8);

impl AuthenticatorFlags {
    pub const USER_PRESENT: u8 = 0x01;
    pub const USER_VERIFIED: u8 = 0x04;
    pub const ATTESTED_CREDENTIAL_DATA: u8 = 0x40;
    pub const EXTENSION_DATA: u8 = 0x80;

    pub fn user_present(self) -> bool {
        self.0 & Self::USER_PRESENT != 0
    }

    pub fn user_verified(self) -> bool {
        self.0 & Self::USER_VERIFIED != 0
    }

    pub fn has_attested_credential_data(self) -> bool {
        self.0 & Self::ATTESTED_CREDENTIAL_DATA != 0
    }

    pub fn has_extension_data(self) -> bool {
        self.0 & Self::EXTENSION_DATA != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedCredentialData<'a> {
    pub aaguid: [u8; AAGUID_LEN],
    pub credential_id: &'a [u8],
    /// COSE-encoded credential public key, exactly one CBOR item.
    pub credential_public_key: &'a [u8],
}

/// Authenticator data decoded from its binary form, borrowing from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorData<'a> {
    pub rp_id_hash: [u8; 32],
    pub flags: AuthenticatorFlags,
    pub counter: u32,
    pub attested_credential_data: Option<AttestedCredentialData<'a>>,
    pub extensions: Option<&'a [u8]>,
}

impl<'a> AuthenticatorData<'a> {
    /// Decodes authenticator data. Presence of the attested credential block
    /// and of extension data is driven by the flags byte only.
    pub fn new(auth_data_byte: &'a [u8]) -> Result<Self, WebAuthnError> {
        if auth_data_byte.len() < HEADER_LEN {
            return Err(WebAuthnError::malformed_data(format!(
                "authenticator data must be at least {} bytes, got {}",
                HEADER_LEN,
                auth_data_byte.len()
            )));
        }

        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&auth_data_byte[0..32]);

        let mut auth_data = AuthenticatorData {
            rp_id_hash,
            flags: AuthenticatorFlags(auth_data_byte[32]),
            counter: BigEndian::read_u32(&auth_data_byte[33..37]),
            attested_credential_data: None,
            extensions: None,
        };

        auth_data.populate_optional_data(&auth_data_byte[HEADER_LEN..])?;

        Ok(auth_data)
    }

    fn populate_optional_data(&mut self, mut rest: &'a [u8]) -> Result<(), WebAuthnError> {
        if self.flags.has_attested_credential_data() {
            if rest.len() < AAGUID_LEN + 2 {
                return Err(WebAuthnError::malformed_data(
                    "attested credential data header truncated",
                ));
            }
            let mut aaguid = [0u8; AAGUID_LEN];
            aaguid.copy_from_slice(&rest[..AAGUID_LEN]);

            let length = BigEndian::read_u16(&rest[AAGUID_LEN..AAGUID_LEN + 2]) as usize;
            let id_start = AAGUID_LEN + 2;
            let id_end = id_start + length;
            if rest.len() < id_end {
                return Err(WebAuthnError::malformed_data(format!(
                    "credential id length {} exceeds remaining {} bytes",
                    length,
                    rest.len() - id_start
                )));
            }
            let credential_id = &rest[id_start..id_end];
            rest = &rest[id_end..];

            let key_len = cbor_item_len(rest)?;
            let credential_public_key = &rest[..key_len];
            rest = &rest[key_len..];

            self.attested_credential_data = Some(AttestedCredentialData {
                aaguid,
                credential_id,
                credential_public_key,
            });
        }

        if self.flags.has_extension_data() {
            if rest.is_empty() {
                return Err(WebAuthnError::malformed_data(
                    "extension flag set but no extension data present",
                ));
            }
            let ext_len = cbor_item_len(rest)?;
            self.extensions = Some(&rest[..ext_len]);
            rest = &rest[ext_len..];
        }

        if !rest.is_empty() {
            return Err(WebAuthnError::malformed_data(format!(
                "{} unexpected trailing bytes",
                rest.len()
            )));
        }

        Ok(())
    }

    /// Re-encodes into the binary layout accepted by [`AuthenticatorData::new`].
    /// Fails if the credential id does not fit the 16-bit length field.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WebAuthnError> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&self.rp_id_hash);
        out.push(self.flags.0);
        let mut counter = [0u8; 4];
        BigEndian::write_u32(&mut counter, self.counter);
        out.extend_from_slice(&counter);

        if let Some(acd) = &self.attested_credential_data {
            out.extend_from_slice(&acd.aaguid);
            let id_len = u16::try_from(acd.credential_id.len()).map_err(|_| {
                WebAuthnError::malformed_data(format!(
                    "credential id of {} bytes exceeds the 16-bit length field",
                    acd.credential_id.len()
                ))
            })?;
            let mut len = [0u8; 2];
            BigEndian::write_u16(&mut len, id_len);
            out.extend_from_slice(&len);
            out.extend_from_slice(acd.credential_id);
            out.extend_from_slice(acd.credential_public_key);
        }
        if let Some(ext) = self.extensions {
            out.extend_from_slice(ext);
        }
        Ok(out)
    }

    pub fn credential_id(&self) -> Option<&'a [u8]> {
        self.attested_credential_data
            .as_ref()
            .map(|acd| acd.credential_id)
    }

    pub(crate) fn verify_rp_id(&self, rp_id: &str) -> Result<(), WebAuthnError> {
        let hash = Sha256::digest(rp_id.as_bytes());
        if self.rp_id_hash != hash.as_slice() {
            Err(WebAuthnError::RelyingPartyMismatch)
        } else {
            Ok(())
        }
    }

    pub(crate) fn verify_credential_id(&self, raw_id: &[u8]) -> Result<(), WebAuthnError> {
        if let Some(credential_id) = self.credential_id() {
            if credential_id == raw_id {
                return Ok(());
            }
        }
        Err(WebAuthnError::malformed_response(
            "rawId does not match the attested credential id",
        ))
    }

    pub(crate) fn require_user_present(&self) -> Result<(), WebAuthnError> {
        if self.flags.user_present() {
            Ok(())
        } else {
            Err(WebAuthnError::UserNotPresent)
        }
    }

    pub(crate) fn require_user_verified(&self) -> Result<(), WebAuthnError> {
        if self.flags.user_verified() {
            Ok(())
        } else {
            Err(WebAuthnError::UserNotVerified)
        }
    }
}

/// Length in bytes of the single CBOR item at the start of `bytes`.
fn cbor_item_len(bytes: &[u8]) -> Result<usize, WebAuthnError> {
    let mut cursor = Cursor::new(bytes);
    ciborium::from_reader::<ciborium::Value, _>(&mut cursor)
        .map_err(|e| WebAuthnError::malformed_data(format!("invalid CBOR item: {}", e)))?;
    Ok(cursor.position() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cose_ec2, fixed_device_point};
    use ciborium::{cbor, Value};

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).unwrap();
        buf
    }

    fn sample_key() -> Vec<u8> {
        cose_ec2(&fixed_device_point())
    }

    #[test]
    fn test_auth_data_new_valid() {
        let mut bytes = vec![0u8; 37];
        bytes[32] = AuthenticatorFlags::USER_PRESENT;
        BigEndian::write_u32(&mut bytes[33..37], 1);

        let auth_data = AuthenticatorData::new(&bytes).unwrap();
        assert_eq!(auth_data.counter, 1);
        assert!(auth_data.flags.user_present());
        assert!(auth_data.attested_credential_data.is_none());
        assert!(auth_data.extensions.is_none());
    }

    #[test]
    fn test_auth_data_new_too_short() {
        let bytes = vec![0u8; 36];
        let result = AuthenticatorData::new(&bytes);
        assert!(matches!(
            result,
            Err(WebAuthnError::MalformedAuthenticatorData(_))
        ));
    }

    #[test]
    fn test_counter_is_big_endian() {
        let mut bytes = vec![0u8; 37];
        bytes[33..37].copy_from_slice(&[0x00, 0x00, 0x01, 0x02]);
        assert_eq!(AuthenticatorData::new(&bytes).unwrap().counter, 258);
    }

    #[test]
    fn test_credential_id_length_overflow() {
        let mut bytes = vec![0u8; 37];
        bytes[32] = AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA;
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&[0x00, 0x40]);
        bytes.extend_from_slice(&[1u8; 10]);
        let result = AuthenticatorData::new(&bytes);
        assert!(matches!(
            result,
            Err(WebAuthnError::MalformedAuthenticatorData(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_without_flags_rejected() {
        let mut bytes = vec![0u8; 37];
        bytes.push(0xa0);
        assert!(AuthenticatorData::new(&bytes).is_err());
    }

    #[test]
    fn test_extension_flag_without_data_rejected() {
        let mut bytes = vec![0u8; 37];
        bytes[32] = AuthenticatorFlags::EXTENSION_DATA;
        assert!(AuthenticatorData::new(&bytes).is_err());
    }

    #[test]
    fn test_round_trip_with_credential_and_extensions() {
        let key = sample_key();
        let ext = encode(&cbor!({ "credProtect" => 1 }).unwrap());
        let credential_id = [0xAAu8; 20];
        let original = AuthenticatorData {
            rp_id_hash: Sha256::digest(b"example.com").into(),
            flags: AuthenticatorFlags(
                AuthenticatorFlags::USER_PRESENT
                    | AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA
                    | AuthenticatorFlags::EXTENSION_DATA,
            ),
            counter: 42,
            attested_credential_data: Some(AttestedCredentialData {
                aaguid: [3u8; 16],
                credential_id: &credential_id,
                credential_public_key: &key,
            }),
            extensions: Some(&ext),
        };

        let bytes = original.to_bytes().unwrap();
        let decoded = AuthenticatorData::new(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_header_only() {
        let original = AuthenticatorData {
            rp_id_hash: [5u8; 32],
            flags: AuthenticatorFlags(AuthenticatorFlags::USER_PRESENT),
            counter: u32::MAX,
            attested_credential_data: None,
            extensions: None,
        };
        let bytes = original.to_bytes().unwrap();
        assert_eq!(bytes.len(), 37);
        assert_eq!(AuthenticatorData::new(&bytes).unwrap(), original);
    }

    #[test]
    fn test_to_bytes_rejects_oversized_credential_id() {
        let credential_id = vec![0u8; usize::from(u16::MAX) + 1];
        let key = sample_key();
        let auth_data = AuthenticatorData {
            rp_id_hash: [0u8; 32],
            flags: AuthenticatorFlags(AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA),
            counter: 0,
            attested_credential_data: Some(AttestedCredentialData {
                aaguid: [0u8; 16],
                credential_id: &credential_id,
                credential_public_key: &key,
            }),
            extensions: None,
        };
        assert!(matches!(
            auth_data.to_bytes(),
            Err(WebAuthnError::MalformedAuthenticatorData(_))
        ));
    }

    #[test]
    fn test_verify_rp_id() {
        let rp_id = "login.example.com";
        let auth_data = AuthenticatorData {
            rp_id_hash: Sha256::digest(rp_id.as_bytes()).into(),
            flags: AuthenticatorFlags(0),
            counter: 0,
            attested_credential_data: None,
            extensions: None,
        };

        assert!(auth_data.verify_rp_id(rp_id).is_ok());
        assert_eq!(
            auth_data.verify_rp_id("evil.example.com"),
            Err(WebAuthnError::RelyingPartyMismatch)
        );
    }

    #[test]
    fn test_verify_credential_id() {
        let key = sample_key();
        let credential_id = [1u8, 2, 3, 4];
        let auth_data = AuthenticatorData {
            rp_id_hash: [0u8; 32],
            flags: AuthenticatorFlags(AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA),
            counter: 0,
            attested_credential_data: Some(AttestedCredentialData {
                aaguid: [0u8; 16],
                credential_id: &credential_id,
                credential_public_key: &key,
            }),
            extensions: None,
        };

        assert!(auth_data.verify_credential_id(&credential_id).is_ok());
        assert!(auth_data.verify_credential_id(&[4, 3, 2, 1]).is_err());
    }
}
