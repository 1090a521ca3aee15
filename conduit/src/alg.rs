use std::fmt;

use kex::KexAlg;

// CipherAlg and HmacAlg are wire constants: the low two bytes of the
// cipheropts word exchanged during the handshake. The remaining bytes of
// the word are reserved.

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CipherAlg {
    Aes256Ctr = 0,
    ChaCha20 = 1,
}

impl CipherAlg {
    pub fn from_u8(v: u8) -> Option<Self> {
        use self::CipherAlg::*;

        match v {
            0 => Some(Aes256Ctr),
            1 => Some(ChaCha20),
            _ => None,
        }
    }

    pub fn key_len(&self) -> usize {
        32
    }

    pub fn iv_len(&self) -> usize {
        use self::CipherAlg::*;

        match self {
            Aes256Ctr => 16,
            ChaCha20 => 12,
        }
    }
}

impl fmt::Display for CipherAlg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::CipherAlg::*;

        match self {
            Aes256Ctr => write!(f, "AES-256-CTR"),
            ChaCha20 => write!(f, "ChaCha20"),
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HmacAlg {
    Sha256 = 0,
    Sha512 = 1,
}

impl HmacAlg {
    pub fn from_u8(v: u8) -> Option<Self> {
        use self::HmacAlg::*;

        match v {
            0 => Some(Sha256),
            1 => Some(Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HmacAlg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::HmacAlg::*;

        match self {
            Sha256 => write!(f, "HMAC-SHA-256"),
            Sha512 => write!(f, "HMAC-SHA-512"),
        }
    }
}

// pack_cipheropts assembles the 32-bit negotiation word: cipher algorithm
// in the low byte, HMAC algorithm in the next byte, remainder reserved
// and transmitted as zero.
pub fn pack_cipheropts(cipher: CipherAlg, hmac: HmacAlg) -> u32 {
    (cipher as u32) | ((hmac as u32) << 8)
}

// unpack_cipheropts splits a received negotiation word. Reserved bytes are
// ignored; unknown algorithm ids yield None and the proposal is refused.
pub fn unpack_cipheropts(word: u32) -> Option<(CipherAlg, HmacAlg)> {
    let cipher = CipherAlg::from_u8((word & 0xff) as u8)?;
    let hmac = HmacAlg::from_u8(((word >> 8) & 0xff) as u8)?;
    Some((cipher, hmac))
}

// AcceptPolicy is the server's three allow-lists. The server has final
// authority over the negotiation: a proposal outside these sets closes the
// connection, there are no downgrade rounds.
#[derive(Clone, Debug)]
pub struct AcceptPolicy {
    pub kex: Vec<KexAlg>,
    pub ciphers: Vec<CipherAlg>,
    pub hmacs: Vec<HmacAlg>,
}

impl Default for AcceptPolicy {
    fn default() -> Self {
        AcceptPolicy {
            kex: vec![
                KexAlg::X25519,
                KexAlg::KyberKem512,
                KexAlg::KyberKem768,
                KexAlg::KyberKem1024,
            ],
            ciphers: vec![CipherAlg::Aes256Ctr, CipherAlg::ChaCha20],
            hmacs: vec![HmacAlg::Sha256, HmacAlg::Sha512],
        }
    }
}

impl AcceptPolicy {
    pub fn permits_kex(&self, alg: KexAlg) -> bool {
        self.kex.contains(&alg)
    }

    pub fn permits_cipher(&self, alg: CipherAlg) -> bool {
        self.ciphers.contains(&alg)
    }

    pub fn permits_hmac(&self, alg: HmacAlg) -> bool {
        self.hmacs.contains(&alg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipheropts_round_trip() {
        let word = pack_cipheropts(CipherAlg::ChaCha20, HmacAlg::Sha512);
        assert_eq!(word, 0x0000_0101);
        assert_eq!(
            unpack_cipheropts(word),
            Some((CipherAlg::ChaCha20, HmacAlg::Sha512))
        );
    }

    #[test]
    fn cipheropts_reserved_bytes_ignored() {
        let word = 0xdead_0000 | pack_cipheropts(CipherAlg::Aes256Ctr, HmacAlg::Sha256);
        assert_eq!(
            unpack_cipheropts(word),
            Some((CipherAlg::Aes256Ctr, HmacAlg::Sha256))
        );
    }

    #[test]
    fn cipheropts_unknown_refused() {
        assert_eq!(unpack_cipheropts(0x0000_00ff), None);
        assert_eq!(unpack_cipheropts(0x0000_ff00), None);
    }

    #[test]
    fn policy_narrows() {
        let policy = AcceptPolicy {
            kex: vec![KexAlg::X25519],
            ciphers: vec![CipherAlg::ChaCha20],
            hmacs: vec![HmacAlg::Sha256],
        };
        assert!(policy.permits_kex(KexAlg::X25519));
        assert!(!policy.permits_kex(KexAlg::KyberKem768));
        assert!(!policy.permits_cipher(CipherAlg::Aes256Ctr));
        assert!(policy.permits_hmac(HmacAlg::Sha256));
        assert!(!policy.permits_hmac(HmacAlg::Sha512));
    }
}
