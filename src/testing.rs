/// Test helpers for constructing synthetic WebAuthn ceremonies.
///
/// Only available under `feature = "testing"` (and in this crate's own unit
/// tests). [`SyntheticAuthenticator`] plays the client side: it builds client
/// data, attestation objects and assertions signed by in-process keys, so the
/// complete verification path can be exercised without a physical security
/// key or TPM.
///
/// Two authenticator kinds are available:
/// - `fido_u2f()` - fixed P-256 device key (signed with `p256`) plus a
///   self-signed P-256 attestation certificate generated with openssl.
/// - `tpm()` - fresh RSA-2048 key, COSE `kty` 3 / `alg` -257. The statement
///   carries only `ver` and `alg`, which is all the verifier inspects.
use crate::{
    authenticator::{AttestedCredentialData, AuthenticatorData, AuthenticatorFlags},
    config::RelyingPartyConfig,
    cose::{decode_compact_key, ALG_ES256, ALG_RS256},
    types::{
        AuthenticationResponse, AuthenticatorAssertionResponse, AuthenticatorAttestationResponse,
        Credential, Format, RegistrationResponse, PUBLIC_KEY_TYPE,
    },
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ciborium::Value;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rand::rand_bytes,
    rsa::Rsa,
    x509::{X509Builder, X509NameBuilder},
};
use p256::ecdsa::{signature::Signer, DerSignature, SigningKey};
use sha2::{Digest, Sha256};

const DEVICE_SCALAR: [u8; 32] = [0x11; 32];
const U2F_CREDENTIAL_ID: [u8; 32] = [0xC0; 32];
const TPM_CREDENTIAL_ID: [u8; 48] = [0x7E; 48];

fn device_signing_key() -> SigningKey {
    SigningKey::from_bytes(&DEVICE_SCALAR.into()).unwrap()
}

/// Uncompressed SEC1 point of the fixed fido-u2f device key.
pub fn fixed_device_point() -> Vec<u8> {
    device_signing_key()
        .verifying_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec()
}

/// CBOR map with integer labels, as COSE keys are encoded.
pub fn cose_map(entries: Vec<(i64, Value)>) -> Vec<u8> {
    let map = Value::Map(
        entries
            .into_iter()
            .map(|(label, value)| (Value::Integer(label.into()), value))
            .collect(),
    );
    let mut buf = Vec::new();
    ciborium::into_writer(&map, &mut buf).unwrap();
    buf
}

/// ES256 COSE key for a 65-byte uncompressed point.
pub fn cose_ec2(point: &[u8]) -> Vec<u8> {
    assert_eq!(point.len(), 65);
    cose_map(vec![
        (1, Value::from(2)),
        (3, Value::from(ALG_ES256)),
        (-1, Value::from(1)),
        (-2, Value::Bytes(point[1..33].to_vec())),
        (-3, Value::Bytes(point[33..65].to_vec())),
    ])
}

/// Self-signed P-256 certificate standing in for a U2F batch attestation
/// certificate. Returns the DER and its private key.
pub fn self_signed_attestation_cert() -> (Vec<u8>, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
    (self_signed_cert(&key), key)
}

/// Same as [`self_signed_attestation_cert`] but with an RSA-2048 key, which
/// fido-u2f does not allow.
pub fn self_signed_rsa_attestation_cert() -> (Vec<u8>, PKey<Private>) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    (self_signed_cert(&key), key)
}

fn self_signed_cert(key: &PKey<Private>) -> Vec<u8> {
    let mut name_builder = X509NameBuilder::new().unwrap();
    name_builder
        .append_entry_by_text("CN", "Test U2F Attestation")
        .unwrap();
    name_builder.append_entry_by_text("O", "Test").unwrap();
    let name = name_builder.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();

    let mut serial_bytes = [0u8; 8];
    rand_bytes(&mut serial_bytes).unwrap();
    let serial = Asn1Integer::from_bn(&BigNum::from_slice(&serial_bytes).unwrap()).unwrap();
    builder.set_serial_number(&serial).unwrap();

    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

/// Relying party used throughout the tests. TPM acceptance is switched on so
/// both formats can be exercised.
pub fn test_config() -> RelyingPartyConfig {
    RelyingPartyConfig::new(
        "login.example.com",
        "https://login.example.com",
        "Example Login",
    )
    .unwrap()
    .with_unverified_tpm(true)
}

enum DeviceKey {
    U2f {
        device: SigningKey,
        attestation_cert: Vec<u8>,
        attestation_key: PKey<Private>,
    },
    Tpm(PKey<Private>),
}

pub struct SyntheticAuthenticator {
    fmt: String,
    key: DeviceKey,
    credential_id: Vec<u8>,
    flags: u8,
    extensions: Option<Vec<u8>>,
    corrupt_signature_base: bool,
}

impl SyntheticAuthenticator {
    pub fn fido_u2f() -> Self {
        let (attestation_cert, attestation_key) = self_signed_attestation_cert();
        SyntheticAuthenticator {
            fmt: "fido-u2f".to_string(),
            key: DeviceKey::U2f {
                device: device_signing_key(),
                attestation_cert,
                attestation_key,
            },
            credential_id: U2F_CREDENTIAL_ID.to_vec(),
            flags: 0x01,
            extensions: None,
            corrupt_signature_base: false,
        }
    }

    pub fn tpm() -> Self {
        let rsa = Rsa::generate(2048).unwrap();
        SyntheticAuthenticator {
            fmt: "tpm".to_string(),
            key: DeviceKey::Tpm(PKey::from_rsa(rsa).unwrap()),
            credential_id: TPM_CREDENTIAL_ID.to_vec(),
            flags: 0x05,
            extensions: None,
            corrupt_signature_base: false,
        }
    }

    /// Flags for both ceremonies. The attested-credential bit is added for
    /// registration and stripped for assertions.
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_format(mut self, fmt: &str) -> Self {
        self.fmt = fmt.to_string();
        self
    }

    /// Appends a `credProtect` extension map and sets the extension flag in
    /// both ceremonies.
    pub fn with_extensions(mut self) -> Self {
        let ext = Value::Map(vec![(Value::Text("credProtect".into()), Value::from(1))]);
        let mut buf = Vec::new();
        ciborium::into_writer(&ext, &mut buf).unwrap();
        self.extensions = Some(buf);
        self
    }

    /// Replaces the fido-u2f attestation certificate with an RSA one.
    pub fn with_rsa_attestation_cert(mut self) -> Self {
        if let DeviceKey::U2f {
            attestation_cert,
            attestation_key,
            ..
        } = &mut self.key
        {
            let (cert, key) = self_signed_rsa_attestation_cert();
            *attestation_cert = cert;
            *attestation_key = key;
        }
        self
    }

    /// The attestation signature will cover a base with one flipped byte.
    pub fn with_corrupted_signature_base(mut self) -> Self {
        self.corrupt_signature_base = true;
        self
    }

    pub fn credential_id(&self) -> &[u8] {
        &self.credential_id
    }

    pub fn public_point(&self) -> Vec<u8> {
        match &self.key {
            DeviceKey::U2f { device, .. } => {
                device.verifying_key().to_encoded_point(false).as_bytes().to_vec()
            }
            DeviceKey::Tpm(_) => panic!("tpm authenticators hold an RSA key"),
        }
    }

    fn cose_key(&self) -> Vec<u8> {
        match &self.key {
            DeviceKey::U2f { .. } => cose_ec2(&self.public_point()),
            DeviceKey::Tpm(key) => {
                let rsa = key.rsa().unwrap();
                cose_map(vec![
                    (1, Value::from(3)),
                    (3, Value::from(ALG_RS256)),
                    (-1, Value::Bytes(rsa.n().to_vec())),
                    (-2, Value::Bytes(rsa.e().to_vec())),
                ])
            }
        }
    }

    /// The record a host would hold after registering this authenticator.
    pub fn credential(&self, owner: &str, counter: u32) -> Credential {
        let (public_key, format) = match &self.key {
            DeviceKey::U2f { .. } => (self.public_point(), Format::FidoU2f),
            DeviceKey::Tpm(_) => (
                decode_compact_key(&self.cose_key())
                    .unwrap()
                    .to_jwk_bytes()
                    .unwrap(),
                Format::Tpm,
            ),
        };
        Credential::new(&self.credential_id, public_key, counter, format, owner)
    }

    pub fn client_data(&self, ceremony: &str, challenge: &[u8], config: &RelyingPartyConfig) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "type": ceremony,
            "challenge": URL_SAFE_NO_PAD.encode(challenge),
            "origin": config.expected_origin(),
            "crossOrigin": false,
        }))
        .unwrap()
    }

    fn authenticator_data(
        &self,
        config: &RelyingPartyConfig,
        flags: u8,
        counter: u32,
        attested_credential_data: Option<AttestedCredentialData<'_>>,
    ) -> Vec<u8> {
        let flags = match self.extensions {
            Some(_) => flags | AuthenticatorFlags::EXTENSION_DATA,
            None => flags,
        };
        AuthenticatorData {
            rp_id_hash: Sha256::digest(config.rp_id.as_bytes()).into(),
            flags: AuthenticatorFlags(flags),
            counter,
            attested_credential_data,
            extensions: self.extensions.as_deref(),
        }
        .to_bytes()
        .unwrap()
    }

    /// Attestation object over `client_data_hash`, counter 0.
    pub fn attestation_object(&self, config: &RelyingPartyConfig, client_data_hash: &[u8; 32]) -> Vec<u8> {
        let cose_key = self.cose_key();
        let auth_data = self.authenticator_data(
            config,
            self.flags | AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA,
            0,
            Some(AttestedCredentialData {
                aaguid: [0u8; 16],
                credential_id: &self.credential_id,
                credential_public_key: &cose_key,
            }),
        );

        let statement = match &self.key {
            DeviceKey::U2f {
                attestation_cert,
                attestation_key,
                ..
            } => {
                let mut signature_base = vec![0x00];
                signature_base.extend_from_slice(&auth_data[..32]);
                signature_base.extend_from_slice(client_data_hash);
                signature_base.extend_from_slice(&self.credential_id);
                signature_base.extend_from_slice(&self.public_point());
                if self.corrupt_signature_base {
                    signature_base[1] ^= 0x01;
                }
                let mut signer =
                    openssl::sign::Signer::new(MessageDigest::sha256(), attestation_key).unwrap();
                let sig = signer.sign_oneshot_to_vec(&signature_base).unwrap();
                vec![
                    (Value::Text("sig".into()), Value::Bytes(sig)),
                    (
                        Value::Text("x5c".into()),
                        Value::Array(vec![Value::Bytes(attestation_cert.clone())]),
                    ),
                ]
            }
            DeviceKey::Tpm(_) => vec![
                (Value::Text("ver".into()), Value::Text("2.0".into())),
                (Value::Text("alg".into()), Value::from(ALG_RS256)),
            ],
        };

        encode_attestation_cbor(&self.fmt, statement, auth_data)
    }

    /// Attestation object whose authenticator data has no credential block.
    pub fn attestation_object_without_credential(&self, config: &RelyingPartyConfig) -> Vec<u8> {
        let flags = self.flags & !AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA;
        let auth_data = self.authenticator_data(config, flags, 0, None);
        encode_attestation_cbor(&self.fmt, Vec::new(), auth_data)
    }

    /// Authenticator data and signature for an assertion at `counter`.
    pub fn assertion(&self, config: &RelyingPartyConfig, client_data: &[u8], counter: u32) -> (Vec<u8>, Vec<u8>) {
        let auth_data = self.authenticator_data(
            config,
            self.flags & !AuthenticatorFlags::ATTESTED_CREDENTIAL_DATA,
            counter,
            None,
        );
        let client_data_hash = Sha256::digest(client_data);

        let mut signature_base = auth_data.clone();
        signature_base.extend_from_slice(&client_data_hash);

        let signature = match &self.key {
            DeviceKey::U2f { device, .. } => {
                let sig: DerSignature = device.sign(&signature_base);
                sig.as_bytes().to_vec()
            }
            DeviceKey::Tpm(key) => {
                let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), key).unwrap();
                signer.sign_oneshot_to_vec(&signature_base).unwrap()
            }
        };
        (auth_data, signature)
    }

    /// Client response to `navigator.credentials.create()`.
    pub fn registration_response(&self, config: &RelyingPartyConfig, challenge: &[u8]) -> RegistrationResponse {
        let client_data = self.client_data("webauthn.create", challenge, config);
        let client_data_hash: [u8; 32] = Sha256::digest(&client_data).into();
        let attestation_object = self.attestation_object(config, &client_data_hash);
        let id = URL_SAFE_NO_PAD.encode(&self.credential_id);

        RegistrationResponse {
            id: Some(id.clone()),
            raw_id: Some(id),
            credential_type: Some(PUBLIC_KEY_TYPE.to_string()),
            response: Some(AuthenticatorAttestationResponse {
                client_data_json: Some(URL_SAFE_NO_PAD.encode(&client_data)),
                attestation_object: Some(URL_SAFE_NO_PAD.encode(&attestation_object)),
            }),
        }
    }

    /// Client response to `navigator.credentials.get()`.
    pub fn authentication_response(
        &self,
        config: &RelyingPartyConfig,
        challenge: &[u8],
        counter: u32,
    ) -> AuthenticationResponse {
        let client_data = self.client_data("webauthn.get", challenge, config);
        let (auth_data, signature) = self.assertion(config, &client_data, counter);
        let id = URL_SAFE_NO_PAD.encode(&self.credential_id);

        AuthenticationResponse {
            id: Some(id.clone()),
            raw_id: Some(id),
            credential_type: Some(PUBLIC_KEY_TYPE.to_string()),
            response: Some(AuthenticatorAssertionResponse {
                client_data_json: Some(URL_SAFE_NO_PAD.encode(&client_data)),
                authenticator_data: Some(URL_SAFE_NO_PAD.encode(&auth_data)),
                signature: Some(URL_SAFE_NO_PAD.encode(&signature)),
                user_handle: None,
            }),
        }
    }
}

fn encode_attestation_cbor(fmt: &str, statement: Vec<(Value, Value)>, auth_data: Vec<u8>) -> Vec<u8> {
    let val = Value::Map(vec![
        (Value::Text("fmt".into()), Value::Text(fmt.to_string())),
        (Value::Text("attStmt".into()), Value::Map(statement)),
        (Value::Text("authData".into()), Value::Bytes(auth_data)),
    ]);

    let mut buf = Vec::new();
    ciborium::into_writer(&val, &mut buf).unwrap();
    buf
}
