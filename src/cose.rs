//! COSE_Key decoding.
//!
//! Credential public keys arrive as a small integer-keyed CBOR map. Only the
//! EC2 (P-256) and RSA key types are understood; everything else is rejected
//! with [`WebAuthnError::UnsupportedAlgorithm`].

use crate::error::WebAuthnError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ciborium::Value;
use openssl::{bn::BigNum, pkey::PKey, pkey::Public, rsa::Rsa};
use serde::{Deserialize, Serialize};

const KTY: i128 = 1;
const ALG: i128 = 3;
const EC2_CRV: i128 = -1;
const EC2_X: i128 = -2;
const EC2_Y: i128 = -3;
const RSA_N: i128 = -1;
const RSA_E: i128 = -2;

const KTY_EC2: i128 = 2;
const KTY_RSA: i128 = 3;
const CRV_P256: i128 = 1;

/// COSE algorithm identifiers offered to clients at registration.
pub const ALG_ES256: i64 = -7;
pub const ALG_RS256: i64 = -257;

pub const UNCOMPRESSED_POINT_LEN: usize = 65;

/// Public key material in a representation independent of its wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedKey {
    /// P-256 public key as affine coordinates.
    Ec2 {
        alg: Option<i64>,
        x: [u8; 32],
        y: [u8; 32],
    },
    Rsa {
        alg: Option<i64>,
        n: Vec<u8>,
        e: Vec<u8>,
    },
}

/// JWK-shaped serialization of a [`NormalizedKey`], used when a credential
/// record has to carry the whole key rather than a bare curve point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
enum Jwk {
    #[serde(rename = "EC")]
    Ec { crv: String, x: String, y: String },
    #[serde(rename = "RSA")]
    Rsa { n: String, e: String },
}

/// Decodes a COSE_Key CBOR map into a [`NormalizedKey`].
pub fn decode_compact_key(bytes: &[u8]) -> Result<NormalizedKey, WebAuthnError> {
    let value: Value = ciborium::from_reader(bytes)
        .map_err(|e| WebAuthnError::malformed_data(format!("invalid COSE key: {}", e)))?;
    let Value::Map(entries) = value else {
        return Err(WebAuthnError::malformed_data("COSE key is not a CBOR map"));
    };

    let kty = int_entry(&entries, KTY)?
        .ok_or_else(|| WebAuthnError::malformed_data("COSE key missing kty"))?;
    let alg = int_entry(&entries, ALG)?
        .map(|a| {
            i64::try_from(a)
                .map_err(|_| WebAuthnError::UnsupportedAlgorithm(format!("COSE alg {}", a)))
        })
        .transpose()?;

    match kty {
        KTY_EC2 => {
            let crv = int_entry(&entries, EC2_CRV)?
                .ok_or_else(|| WebAuthnError::malformed_data("EC2 key missing crv"))?;
            if crv != CRV_P256 {
                return Err(WebAuthnError::UnsupportedAlgorithm(format!(
                    "EC2 curve {}",
                    crv
                )));
            }
            let x = coordinate(&entries, EC2_X)?;
            let y = coordinate(&entries, EC2_Y)?;
            let key = NormalizedKey::Ec2 { alg, x, y };
            // Rejects coordinates that are not on the curve.
            p256::PublicKey::from_sec1_bytes(&compact_key_to_point(&key)?).map_err(|_| {
                WebAuthnError::malformed_data("EC2 coordinates are not a valid P-256 point")
            })?;
            Ok(key)
        }
        KTY_RSA => {
            let n = bytes_entry(&entries, RSA_N)?
                .ok_or_else(|| WebAuthnError::malformed_data("RSA key missing modulus"))?;
            let e = bytes_entry(&entries, RSA_E)?
                .ok_or_else(|| WebAuthnError::malformed_data("RSA key missing exponent"))?;
            Ok(NormalizedKey::Rsa {
                alg,
                n: n.to_vec(),
                e: e.to_vec(),
            })
        }
        other => Err(WebAuthnError::UnsupportedAlgorithm(format!(
            "COSE key type {}",
            other
        ))),
    }
}

/// Uncompressed SEC1 point `0x04 || x || y` of an EC2 key.
pub fn compact_key_to_point(key: &NormalizedKey) -> Result<[u8; 65], WebAuthnError> {
    match key {
        NormalizedKey::Ec2 { x, y, .. } => {
            let mut point = [0u8; UNCOMPRESSED_POINT_LEN];
            point[0] = 0x04;
            point[1..33].copy_from_slice(x);
            point[33..].copy_from_slice(y);
            Ok(point)
        }
        NormalizedKey::Rsa { .. } => Err(WebAuthnError::UnsupportedAlgorithm(
            "RSA key has no curve point".to_string(),
        )),
    }
}

impl NormalizedKey {
    pub fn is_rsa(&self) -> bool {
        matches!(self, NormalizedKey::Rsa { .. })
    }

    pub fn to_jwk_bytes(&self) -> Result<Vec<u8>, WebAuthnError> {
        let jwk = match self {
            NormalizedKey::Ec2 { x, y, .. } => Jwk::Ec {
                crv: "P-256".to_string(),
                x: URL_SAFE_NO_PAD.encode(x),
                y: URL_SAFE_NO_PAD.encode(y),
            },
            NormalizedKey::Rsa { n, e, .. } => Jwk::Rsa {
                n: URL_SAFE_NO_PAD.encode(n),
                e: URL_SAFE_NO_PAD.encode(e),
            },
        };
        serde_json::to_vec(&jwk)
            .map_err(|e| WebAuthnError::Configuration(format!("failed to encode JWK: {}", e)))
    }

    pub fn from_jwk_bytes(bytes: &[u8]) -> Result<Self, WebAuthnError> {
        let jwk: Jwk = serde_json::from_slice(bytes)
            .map_err(|e| WebAuthnError::malformed_data(format!("invalid stored JWK: {}", e)))?;
        let decode = |field: &str| {
            URL_SAFE_NO_PAD
                .decode(field)
                .map_err(|_| WebAuthnError::malformed_data("invalid base64url in stored JWK"))
        };
        match jwk {
            Jwk::Ec { crv, x, y } => {
                if crv != "P-256" {
                    return Err(WebAuthnError::UnsupportedAlgorithm(format!("curve {}", crv)));
                }
                Ok(NormalizedKey::Ec2 {
                    alg: Some(ALG_ES256),
                    x: fixed32(&decode(&x)?)?,
                    y: fixed32(&decode(&y)?)?,
                })
            }
            Jwk::Rsa { n, e } => Ok(NormalizedKey::Rsa {
                alg: Some(ALG_RS256),
                n: decode(&n)?,
                e: decode(&e)?,
            }),
        }
    }

    /// Builds an openssl verification key for this key material.
    pub(crate) fn to_pkey(&self) -> Result<PKey<Public>, WebAuthnError> {
        match self {
            NormalizedKey::Ec2 { .. } => {
                let pem = crate::pem::point_or_cert_to_pem(&compact_key_to_point(self)?)?;
                crate::pem::public_key_from_pem(&pem)
            }
            NormalizedKey::Rsa { n, e, .. } => {
                let rsa = BigNum::from_slice(n)
                    .and_then(|n| Ok((n, BigNum::from_slice(e)?)))
                    .and_then(|(n, e)| Rsa::from_public_components(n, e))
                    .map_err(|_| WebAuthnError::malformed_data("invalid RSA public key"))?;
                PKey::from_rsa(rsa)
                    .map_err(|_| WebAuthnError::malformed_data("invalid RSA public key"))
            }
        }
    }
}

fn lookup(entries: &[(Value, Value)], label: i128) -> Option<&Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == label => Some(v),
        _ => None,
    })
}

fn int_entry(entries: &[(Value, Value)], label: i128) -> Result<Option<i128>, WebAuthnError> {
    match lookup(entries, label) {
        None => Ok(None),
        Some(Value::Integer(i)) => Ok(Some(i128::from(*i))),
        Some(_) => Err(WebAuthnError::malformed_data(format!(
            "COSE key label {} is not an integer",
            label
        ))),
    }
}

fn bytes_entry(entries: &[(Value, Value)], label: i128) -> Result<Option<&[u8]>, WebAuthnError> {
    match lookup(entries, label) {
        None => Ok(None),
        Some(Value::Bytes(b)) => Ok(Some(b.as_slice())),
        Some(_) => Err(WebAuthnError::malformed_data(format!(
            "COSE key label {} is not a byte string",
            label
        ))),
    }
}

fn coordinate(entries: &[(Value, Value)], label: i128) -> Result<[u8; 32], WebAuthnError> {
    let bytes = bytes_entry(entries, label)?
        .ok_or_else(|| WebAuthnError::malformed_data("EC2 key missing coordinate"))?;
    fixed32(bytes)
}

fn fixed32(bytes: &[u8]) -> Result<[u8; 32], WebAuthnError> {
    bytes
        .try_into()
        .map_err(|_| WebAuthnError::malformed_data("P-256 coordinate must be 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cose_ec2, cose_map, fixed_device_point};

    #[test]
    fn test_decodes_ec2_and_emits_uncompressed_point() {
        let point = fixed_device_point();
        let key = decode_compact_key(&cose_ec2(&point)).unwrap();
        let out = compact_key_to_point(&key).unwrap();
        assert_eq!(out.len(), 65);
        assert_eq!(out[0], 0x04);
        assert_eq!(out.as_slice(), point.as_slice());
    }

    #[test]
    fn test_rejects_point_off_curve() {
        let mut point = fixed_device_point();
        point[64] ^= 0x01;
        assert!(matches!(
            decode_compact_key(&cose_ec2(&point)),
            Err(WebAuthnError::MalformedAuthenticatorData(_))
        ));
    }

    #[test]
    fn test_decodes_rsa() {
        let bytes = cose_map(vec![
            (1, Value::from(3)),
            (3, Value::from(-257)),
            (-1, Value::Bytes(vec![0xC1; 256])),
            (-2, Value::Bytes(vec![1, 0, 1])),
        ]);
        let key = decode_compact_key(&bytes).unwrap();
        assert!(key.is_rsa());
        assert!(compact_key_to_point(&key).is_err());
    }

    #[test]
    fn test_rejects_unknown_key_type() {
        let bytes = cose_map(vec![
            (1, Value::from(1)),
            (3, Value::from(-8)),
            (-1, Value::from(6)),
        ]);
        assert!(matches!(
            decode_compact_key(&bytes),
            Err(WebAuthnError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_rejects_alg_outside_i64() {
        let point = fixed_device_point();
        let bytes = cose_map(vec![
            (1, Value::from(2)),
            (3, Value::Integer(u64::MAX.into())),
            (-1, Value::from(1)),
            (-2, Value::Bytes(point[1..33].to_vec())),
            (-3, Value::Bytes(point[33..65].to_vec())),
        ]);
        assert!(matches!(
            decode_compact_key(&bytes),
            Err(WebAuthnError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_rejects_other_curves() {
        let bytes = cose_map(vec![
            (1, Value::from(2)),
            (3, Value::from(-35)),
            (-1, Value::from(2)),
            (-2, Value::Bytes(vec![0; 48])),
            (-3, Value::Bytes(vec![0; 48])),
        ]);
        assert!(matches!(
            decode_compact_key(&bytes),
            Err(WebAuthnError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_rejects_non_map() {
        let mut buf = Vec::new();
        ciborium::into_writer(&Value::from(7), &mut buf).unwrap();
        assert!(decode_compact_key(&buf).is_err());
    }

    #[test]
    fn test_jwk_round_trip() {
        let key = decode_compact_key(&cose_ec2(&fixed_device_point())).unwrap();
        let restored = NormalizedKey::from_jwk_bytes(&key.to_jwk_bytes().unwrap()).unwrap();
        assert_eq!(
            compact_key_to_point(&restored).unwrap(),
            compact_key_to_point(&key).unwrap()
        );
        assert!(restored.to_pkey().is_ok());
    }
}
