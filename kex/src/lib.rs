use std::{error, fmt};

use pqcrypto_kyber::{kyber1024, kyber512, kyber768};
use pqcrypto_traits::kem::{
    Ciphertext as CiphertextBytes, PublicKey as PublicKeyBytes,
    SharedSecret as SharedSecretBytes,
};
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

// KexAlg names one member of the closed set of key agreement primitives
// the secured channel can negotiate. The identifier is carried on the wire
// as the first handshake line, so the discriminants are wire constants.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KexAlg {
    X25519 = 0,
    KyberKem512 = 1,
    KyberKem768 = 2,
    KyberKem1024 = 3,
}

impl KexAlg {
    pub fn from_u8(v: u8) -> Option<Self> {
        use self::KexAlg::*;

        match v {
            0 => Some(X25519),
            1 => Some(KyberKem512),
            2 => Some(KyberKem768),
            3 => Some(KyberKem1024),
            _ => None,
        }
    }

    // initiator_blob_len is the exact size of the initiator's public blob.
    // The wire framing strips leading zero bytes, so receivers left-pad
    // back to this length before handing the blob to the adapter.
    pub fn initiator_blob_len(&self) -> usize {
        use self::KexAlg::*;

        match self {
            X25519 => 32,
            KyberKem512 => kyber512::public_key_bytes(),
            KyberKem768 => kyber768::public_key_bytes(),
            KyberKem1024 => kyber1024::public_key_bytes(),
        }
    }

    // reply_blob_len is the exact size of the responder's reply blob: the
    // responder's public key for the DH member, the encapsulated
    // ciphertext for the KEM members.
    pub fn reply_blob_len(&self) -> usize {
        use self::KexAlg::*;

        match self {
            X25519 => 32,
            KyberKem512 => kyber512::ciphertext_bytes(),
            KyberKem768 => kyber768::ciphertext_bytes(),
            KyberKem1024 => kyber1024::ciphertext_bytes(),
        }
    }
}

impl fmt::Display for KexAlg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::KexAlg::*;

        match self {
            X25519 => write!(f, "X25519"),
            KyberKem512 => write!(f, "KyberKEM-512"),
            KyberKem768 => write!(f, "KyberKEM-768"),
            KyberKem1024 => write!(f, "KyberKEM-1024"),
        }
    }
}

#[derive(Debug)]
pub enum KexError {
    UnknownAlg(u8),
    // the peer's blob could not be accepted by the primitive
    BadBlob(KexAlg),
    WrongBlobSize { alg: KexAlg, expected: usize, actual: usize },
}

impl error::Error for KexError {}

impl fmt::Display for KexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::KexError::*;

        match self {
            &UnknownAlg(id) => write!(f, "unknown kex algorithm id: {:#04x}", id),
            &BadBlob(alg) => write!(f, "malformed {} blob", alg),
            &WrongBlobSize { alg, expected, actual } => write!(
                f,
                "wrong {} blob size: expected {} bytes, got {}",
                alg, expected, actual
            ),
        }
    }
}

// SharedSecret owns the raw agreement output. The buffer is wiped when the
// secret is dropped; callers expand it into cipher and HMAC key material
// and must not retain it past key derivation.
pub struct SharedSecret {
    bytes: Vec<u8>,
}

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SharedSecret [ {} bytes ]", self.bytes.len())
    }
}

// Initiator is the client half of the uniform two-role contract: it
// produces a public blob on construction and yields the shared secret
// once the peer's reply blob arrives.
pub struct Initiator {
    alg: KexAlg,
    state: InitiatorState,
}

enum InitiatorState {
    X25519(StaticSecret),
    Kyber512(kyber512::SecretKey),
    Kyber768(kyber768::SecretKey),
    Kyber1024(kyber1024::SecretKey),
}

impl Initiator {
    // new generates the initiator's ephemeral key for the requested
    // algorithm and returns the public blob to transmit.
    pub fn new(alg: KexAlg) -> (Self, Vec<u8>) {
        use self::InitiatorState::*;

        let (state, blob) = match alg {
            KexAlg::X25519 => {
                let secret = StaticSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                (X25519(secret), public.as_bytes().to_vec())
            }
            KexAlg::KyberKem512 => {
                let (pk, sk) = kyber512::keypair();
                (Kyber512(sk), pk.as_bytes().to_vec())
            }
            KexAlg::KyberKem768 => {
                let (pk, sk) = kyber768::keypair();
                (Kyber768(sk), pk.as_bytes().to_vec())
            }
            KexAlg::KyberKem1024 => {
                let (pk, sk) = kyber1024::keypair();
                (Kyber1024(sk), pk.as_bytes().to_vec())
            }
        };

        (Initiator { alg: alg, state: state }, blob)
    }

    pub fn alg(&self) -> KexAlg {
        self.alg
    }

    // finish consumes the peer's reply blob and yields the shared secret.
    pub fn finish(self, reply: &[u8]) -> Result<SharedSecret, KexError> {
        use self::InitiatorState::*;

        let expected = self.alg.reply_blob_len();
        if reply.len() != expected {
            return Err(KexError::WrongBlobSize {
                alg: self.alg,
                expected: expected,
                actual: reply.len(),
            });
        }

        let bytes = match self.state {
            X25519(secret) => {
                let mut public = [0; 32];
                public.copy_from_slice(reply);
                let public = x25519_dalek::PublicKey::from(public);
                secret.diffie_hellman(&public).as_bytes().to_vec()
            }
            Kyber512(sk) => {
                let ct = kyber512::Ciphertext::from_bytes(reply)
                    .map_err(|_| KexError::BadBlob(self.alg))?;
                kyber512::decapsulate(&ct, &sk).as_bytes().to_vec()
            }
            Kyber768(sk) => {
                let ct = kyber768::Ciphertext::from_bytes(reply)
                    .map_err(|_| KexError::BadBlob(self.alg))?;
                kyber768::decapsulate(&ct, &sk).as_bytes().to_vec()
            }
            Kyber1024(sk) => {
                let ct = kyber1024::Ciphertext::from_bytes(reply)
                    .map_err(|_| KexError::BadBlob(self.alg))?;
                kyber1024::decapsulate(&ct, &sk).as_bytes().to_vec()
            }
        };

        Ok(SharedSecret { bytes: bytes })
    }
}

// respond is the server half of the contract: consume the initiator's
// blob, produce the reply blob, and yield the same shared secret.
pub fn respond(alg: KexAlg, blob: &[u8]) -> Result<(Vec<u8>, SharedSecret), KexError> {
    let expected = alg.initiator_blob_len();
    if blob.len() != expected {
        return Err(KexError::WrongBlobSize {
            alg: alg,
            expected: expected,
            actual: blob.len(),
        });
    }

    let (reply, bytes) = match alg {
        KexAlg::X25519 => {
            let mut public = [0; 32];
            public.copy_from_slice(blob);
            let theirs = x25519_dalek::PublicKey::from(public);

            let secret = StaticSecret::random_from_rng(OsRng);
            let ours = x25519_dalek::PublicKey::from(&secret);
            (
                ours.as_bytes().to_vec(),
                secret.diffie_hellman(&theirs).as_bytes().to_vec(),
            )
        }
        KexAlg::KyberKem512 => {
            let pk = kyber512::PublicKey::from_bytes(blob)
                .map_err(|_| KexError::BadBlob(alg))?;
            let (ss, ct) = kyber512::encapsulate(&pk);
            (ct.as_bytes().to_vec(), ss.as_bytes().to_vec())
        }
        KexAlg::KyberKem768 => {
            let pk = kyber768::PublicKey::from_bytes(blob)
                .map_err(|_| KexError::BadBlob(alg))?;
            let (ss, ct) = kyber768::encapsulate(&pk);
            (ct.as_bytes().to_vec(), ss.as_bytes().to_vec())
        }
        KexAlg::KyberKem1024 => {
            let pk = kyber1024::PublicKey::from_bytes(blob)
                .map_err(|_| KexError::BadBlob(alg))?;
            let (ss, ct) = kyber1024::encapsulate(&pk);
            (ct.as_bytes().to_vec(), ss.as_bytes().to_vec())
        }
    };

    Ok((reply, SharedSecret { bytes: bytes }))
}

#[cfg(test)]
mod tests {
    use super::{respond, Initiator, KexAlg, KexError};

    fn agree(alg: KexAlg) {
        let (initiator, blob) = Initiator::new(alg);
        assert_eq!(blob.len(), alg.initiator_blob_len());

        let (reply, server_secret) = respond(alg, &blob).unwrap();
        assert_eq!(reply.len(), alg.reply_blob_len());

        let client_secret = initiator.finish(&reply).unwrap();
        assert_eq!(client_secret.as_bytes(), server_secret.as_bytes());
        assert!(!client_secret.as_bytes().is_empty());
    }

    #[test]
    fn x25519_agreement() {
        agree(KexAlg::X25519);
    }

    #[test]
    fn kyber512_agreement() {
        agree(KexAlg::KyberKem512);
    }

    #[test]
    fn kyber768_agreement() {
        agree(KexAlg::KyberKem768);
    }

    #[test]
    fn kyber1024_agreement() {
        agree(KexAlg::KyberKem1024);
    }

    #[test]
    fn wrong_blob_size_rejected() {
        let (initiator, _) = Initiator::new(KexAlg::X25519);
        match initiator.finish(&[0; 16]) {
            Err(KexError::WrongBlobSize { expected: 32, actual: 16, .. }) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        match respond(KexAlg::KyberKem768, &[0; 3]) {
            Err(KexError::WrongBlobSize { .. }) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn alg_ids_round_trip() {
        for id in 0..4 {
            let alg = KexAlg::from_u8(id).unwrap();
            assert_eq!(alg as u8, id);
        }
        assert!(KexAlg::from_u8(4).is_none());
        assert!(KexAlg::from_u8(0xff).is_none());
    }
}
