//! AES-128 counter mode with an optional running CBC-MAC.

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use serde::{Deserialize, Serialize};

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Transfer key length in bytes.
pub const KEY_LENGTH: usize = 16;

/// A single cipher block, also used as a running MAC state.
pub type MacBlock = [u8; BLOCK_SIZE];

/// Per-file counter-mode nonce.
///
/// The counter block for file offset `pos` is the nonce followed by
/// `pos / 16` as a big-endian 64-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CtrIv(pub [u8; 8]);

impl CtrIv {
    /// MAC seed for a chunk processed from its first byte: nonce ‖ nonce.
    pub fn initial_mac(&self) -> MacBlock {
        let mut mac = [0u8; BLOCK_SIZE];
        mac[..8].copy_from_slice(&self.0);
        mac[8..].copy_from_slice(&self.0);
        mac
    }

    fn counter_block(&self, block_index: u64) -> MacBlock {
        let mut ctr = [0u8; BLOCK_SIZE];
        ctr[..8].copy_from_slice(&self.0);
        ctr[8..].copy_from_slice(&block_index.to_be_bytes());
        ctr
    }
}

/// Whether [`TransferCipher::ctr_crypt`] encrypts or decrypts.
///
/// The MAC is always computed over plaintext, so the direction decides
/// whether it is absorbed before or after the keystream is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptDirection {
    Encrypt,
    Decrypt,
}

/// AES-128 cipher bound to one transfer key.
#[derive(Clone)]
pub struct TransferCipher {
    aes: Aes128,
}

impl fmt::Debug for TransferCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransferCipher { .. }")
    }
}

impl TransferCipher {
    /// Create a cipher for the given transfer key.
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            aes: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    /// Encrypt one block in place (ECB).
    pub fn encrypt_block(&self, block: &mut MacBlock) {
        self.aes.encrypt_block(GenericArray::from_mut_slice(block));
    }

    /// Apply the counter-mode keystream to `data`, which starts at file
    /// offset `pos`, updating `mac` over the plaintext as it goes.
    ///
    /// `pos` must be block aligned. A short final block is treated as
    /// zero-padded for MAC purposes. With `init_mac`, `mac` is first reset
    /// to the nonce seed.
    pub fn ctr_crypt(
        &self,
        data: &mut [u8],
        pos: u64,
        iv: CtrIv,
        mut mac: Option<&mut MacBlock>,
        direction: CryptDirection,
        init_mac: bool,
    ) {
        debug_assert_eq!(pos % BLOCK_SIZE as u64, 0, "ctr position not block aligned");

        if init_mac {
            if let Some(m) = mac.as_deref_mut() {
                *m = iv.initial_mac();
            }
        }

        let mut counter = pos / BLOCK_SIZE as u64;
        for block in data.chunks_mut(BLOCK_SIZE) {
            if direction == CryptDirection::Encrypt {
                if let Some(m) = mac.as_deref_mut() {
                    self.absorb(m, block);
                }
            }

            let mut keystream = iv.counter_block(counter);
            self.encrypt_block(&mut keystream);
            for (b, k) in block.iter_mut().zip(keystream.iter()) {
                *b ^= k;
            }

            if direction == CryptDirection::Decrypt {
                if let Some(m) = mac.as_deref_mut() {
                    self.absorb(m, block);
                }
            }
            counter += 1;
        }
    }

    /// CBC-MAC step: XOR a (possibly short) block into the state, then encrypt.
    fn absorb(&self, mac: &mut MacBlock, block: &[u8]) {
        for (m, b) in mac.iter_mut().zip(block.iter()) {
            *m ^= b;
        }
        self.encrypt_block(mac);
    }
}
