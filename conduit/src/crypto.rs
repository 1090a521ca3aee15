use aes::Aes256;
use chacha20::ChaCha20;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

use crate::alg::{CipherAlg, HmacAlg};

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

// expand_key_material stretches the KEX shared secret until it covers the
// requested key+IV length: while too short, the SHA-256 digest of the
// running material is appended. Both peers perform the same expansion, so
// the derived states agree.
pub fn expand_key_material(secret: &[u8], need: usize) -> Vec<u8> {
    let mut material = secret.to_vec();
    while material.len() < need {
        let digest = Sha256::digest(&material);
        material.extend_from_slice(&digest);
    }
    material.truncate(need);
    material
}

// CipherStream is a keyed stream cipher for one direction of the channel.
// Every call XORs the keystream into the buffer in place; encryption and
// decryption are the same operation.
pub enum CipherStream {
    Aes256Ctr(Box<Aes256Ctr>),
    ChaCha20(Box<ChaCha20>),
}

impl CipherStream {
    fn new(alg: CipherAlg, key: &[u8], iv: &[u8]) -> Self {
        use self::CipherStream::*;

        let mut k = [0; 32];
        k.copy_from_slice(key);

        match alg {
            CipherAlg::Aes256Ctr => {
                let mut v = [0; 16];
                v.copy_from_slice(iv);
                Aes256Ctr(Box::new(Ctr128BE::<Aes256>::new(&k.into(), &v.into())))
            }
            CipherAlg::ChaCha20 => {
                let mut v = [0; 12];
                v.copy_from_slice(iv);
                ChaCha20(Box::new(chacha20::ChaCha20::new(&k.into(), &v.into())))
            }
        }
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        use self::CipherStream::*;

        match self {
            Aes256Ctr(c) => c.apply_keystream(buf),
            ChaCha20(c) => c.apply_keystream(buf),
        }
    }
}

// RunningHmac is the per-direction running keyed hash. Every plaintext
// byte that crosses the record layer, pad headers and padding included, is
// mirrored into it; the 4-byte prefix of the running digest travels in the
// frame header.
pub enum RunningHmac {
    Sha256(HmacSha256),
    Sha512(HmacSha512),
}

impl RunningHmac {
    fn new(alg: HmacAlg, key: &[u8]) -> Self {
        use self::RunningHmac::*;

        match alg {
            // any key length is acceptable to HMAC
            HmacAlg::Sha256 => Sha256(Mac::new_from_slice(key).expect("hmac key")),
            HmacAlg::Sha512 => Sha512(Mac::new_from_slice(key).expect("hmac key")),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        use self::RunningHmac::*;

        match self {
            Sha256(m) => m.update(data),
            Sha512(m) => m.update(data),
        }
    }

    // prefix4 peeks at the running digest without consuming the state.
    pub fn prefix4(&self) -> [u8; 4] {
        use self::RunningHmac::*;

        let mut out = [0; 4];
        match self {
            Sha256(m) => out.copy_from_slice(&m.clone().finalize().into_bytes()[..4]),
            Sha512(m) => out.copy_from_slice(&m.clone().finalize().into_bytes()[..4]),
        }
        out
    }
}

// DirectionKeys bundles the cipher and HMAC state of one direction. The
// write path and the read path each own one instance; neither is shared,
// so no locking happens at this level.
pub struct DirectionKeys {
    pub cipher: CipherStream,
    pub hmac: RunningHmac,
}

impl DirectionKeys {
    pub fn new(material: &[u8], cipher: CipherAlg, hmac: HmacAlg) -> Self {
        let key = &material[..cipher.key_len()];
        let iv = &material[cipher.key_len()..cipher.key_len() + cipher.iv_len()];

        DirectionKeys {
            cipher: CipherStream::new(cipher, key, iv),
            // the HMAC is keyed with the IV that seeded the cipher
            hmac: RunningHmac::new(hmac, iv),
        }
    }
}

// derive_pair expands the shared secret and keys both directions from the
// same material. The instances are independent, which keeps each running
// read HMAC an exact mirror of the peer's write HMAC.
pub fn derive_pair(
    secret: &[u8],
    cipher: CipherAlg,
    hmac: HmacAlg,
) -> (DirectionKeys, DirectionKeys) {
    let mut material = expand_key_material(secret, cipher.key_len() + cipher.iv_len());
    let tx = DirectionKeys::new(&material, cipher, hmac);
    let rx = DirectionKeys::new(&material, cipher, hmac);
    material.zeroize();
    (tx, rx)
}
