//! OCB2-AES128 as used for Mumble voice datagrams.
//!
//! Wire layout: byte 0 is the low byte of the encrypt nonce, bytes 1..4 the
//! truncated tag, then the ciphertext. Nonces are per direction and advance
//! by exactly one per packet; the receiver accepts up to 30 packets of
//! reordering through a 256-slot history.

use crate::error::DecryptError;
use crate::proto::mumble::CryptSetup;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use bytes::BytesMut;
use ring::rand::{SecureRandom, SystemRandom};
use std::time::Instant;

lazy_static! {
    static ref SYSTEM_RANDOM: SystemRandom = SystemRandom::new();
}

pub const KEY_SIZE: usize = 16;
const BLOCK_SIZE: usize = std::mem::size_of::<u128>();

pub struct CryptState {
    pub key: [u8; KEY_SIZE],
    // internally as native endianness, externally as little endian and during ocb_* as big endian
    encrypt_nonce: u128,
    decrypt_nonce: u128,
    decrypt_history: [u8; 0x100],
    aes: Aes128,

    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
    pub last_good: Instant,
}

impl Default for CryptState {
    fn default() -> Self {
        let mut key = [0u8; KEY_SIZE];
        SYSTEM_RANDOM.fill(&mut key).expect("failed to generate random key");

        Self::new(key)
    }
}

impl CryptState {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            aes: Aes128::new(GenericArray::from_slice(&key)),
            key,
            encrypt_nonce: 0,
            decrypt_nonce: 1 << 127,
            decrypt_history: [0; 0x100],

            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
            last_good: Instant::now(),
        }
    }

    /// Client-side construction from a received CryptSetup: our encrypt nonce
    /// is the server's client_nonce, our decrypt nonce the server_nonce.
    pub fn new_from_setup(key: [u8; KEY_SIZE], encrypt_nonce: &[u8], decrypt_nonce: &[u8]) -> Option<Self> {
        let mut state = Self::new(key);
        state.encrypt_nonce = u128::from_le_bytes(encrypt_nonce.try_into().ok()?);
        state.decrypt_nonce = u128::from_le_bytes(decrypt_nonce.try_into().ok()?);

        Some(state)
    }

    pub fn reset(&mut self) {
        self.encrypt_nonce = 0;
        self.decrypt_nonce = 1 << 127;
        self.decrypt_history = [0; 0x100];
        self.good = 0;
        self.late = 0;
        self.lost = 0;
        self.resync = 0;
        self.last_good = Instant::now();
    }

    /// Returns the nonce used for encrypting.
    pub fn get_encrypt_nonce(&self) -> [u8; BLOCK_SIZE] {
        self.encrypt_nonce.to_le_bytes()
    }

    /// Returns the nonce used for decrypting.
    pub fn get_decrypt_nonce(&self) -> [u8; BLOCK_SIZE] {
        self.decrypt_nonce.to_le_bytes()
    }

    /// Installs the peer's encrypt nonce after a resync request.
    pub fn set_decrypt_nonce(&mut self, nonce: &[u8]) {
        if let Ok(nonce) = nonce.try_into() {
            self.decrypt_nonce = u128::from_le_bytes(nonce);
            self.resync += 1;
        }
    }

    pub fn get_crypt_setup(&self) -> CryptSetup {
        CryptSetup {
            key: Some(self.key.to_vec()),
            client_nonce: Some(self.get_decrypt_nonce().to_vec()),
            server_nonce: Some(self.get_encrypt_nonce().to_vec()),
        }
    }

    /// Encrypts `plain`, appending header and ciphertext to `dst`.
    pub fn encrypt(&mut self, plain: &[u8], dst: &mut BytesMut) {
        self.encrypt_nonce = self.encrypt_nonce.wrapping_add(1);

        let start = dst.len();
        dst.resize(start + 4, 0);
        dst.extend_from_slice(plain);

        let tag = self.ocb_encrypt(&mut dst[start + 4..]);

        dst[start] = self.encrypt_nonce as u8;
        dst[start + 1..start + 4].copy_from_slice(&tag.to_be_bytes()[0..3]);
    }

    /// Decrypts a voice datagram in place; on success `buf` holds the
    /// plaintext packet.
    pub fn decrypt(&mut self, buf: &mut BytesMut) -> Result<(), DecryptError> {
        if buf.len() < 4 {
            return Err(DecryptError::Eof);
        }
        let header = buf.split_to(4);
        let nonce_0 = header[0];

        // If we update our decrypt_nonce and the tag check fails or we've been processing late
        // packets, we need to revert it
        let saved_nonce = self.decrypt_nonce;
        let mut late = false;
        let mut lost = 0;

        if self.decrypt_nonce.wrapping_add(1) as u8 == nonce_0 {
            // in order
            self.decrypt_nonce = self.decrypt_nonce.wrapping_add(1);
        } else {
            // packet is late or repeated, or we lost a few packets in between
            let diff = nonce_0.wrapping_sub(self.decrypt_nonce as u8) as i8;
            self.decrypt_nonce = self.decrypt_nonce.wrapping_add(diff as u128);

            if diff > 0 {
                lost = i32::from(diff - 1);
            } else if diff > -30 {
                if self.decrypt_history[nonce_0 as usize] == (self.decrypt_nonce >> 8) as u8 {
                    self.decrypt_nonce = saved_nonce;

                    return Err(DecryptError::Repeat);
                }
                late = true;
                lost = -1;
            } else {
                self.decrypt_nonce = saved_nonce;
                return Err(DecryptError::Late);
            }
        }

        let tag = self.ocb_decrypt(buf.as_mut());

        if Ok(()) != ring::constant_time::verify_slices_are_equal(&header[1..4], &tag.to_be_bytes()[0..3]) {
            self.decrypt_nonce = saved_nonce;
            return Err(DecryptError::Mac);
        }

        self.decrypt_history[nonce_0 as usize] = (self.decrypt_nonce >> 8) as u8;
        self.good += 1;
        self.last_good = Instant::now();

        if late {
            self.late += 1;
            self.decrypt_nonce = saved_nonce;
        }

        self.lost = (self.lost as i32 + lost).max(0) as u32;

        Ok(())
    }

    /// Encrypt the provided buffer using AES-OCB, returning the tag.
    fn ocb_encrypt(&self, mut buf: &mut [u8]) -> u128 {
        let mut offset = self.aes_encrypt(self.encrypt_nonce.to_be());
        let mut checksum = 0u128;

        while buf.len() > BLOCK_SIZE {
            let (chunk, remainder) = buf.split_at_mut(BLOCK_SIZE);
            buf = remainder;
            let chunk: &mut [u8; BLOCK_SIZE] = chunk.try_into().expect("split_at works");

            offset = s2(offset);

            let plain = u128::from_be_bytes(*chunk);
            let encrypted = self.aes_encrypt(offset ^ plain) ^ offset;
            chunk.copy_from_slice(&encrypted.to_be_bytes());

            checksum ^= plain;
        }

        offset = s2(offset);

        let len = buf.len();
        assert!(len <= BLOCK_SIZE);
        let pad = self.aes_encrypt((len * 8) as u128 ^ offset);
        let mut block = pad.to_be_bytes();
        block[..len].copy_from_slice(buf);
        let plain = u128::from_be_bytes(block);
        let encrypted = pad ^ plain;
        buf.copy_from_slice(&encrypted.to_be_bytes()[..len]);

        checksum ^= plain;

        self.aes_encrypt(offset ^ s2(offset) ^ checksum)
    }

    /// Decrypt the provided buffer using AES-OCB, returning the tag.
    /// **Make sure to verify that the tag matches!**
    fn ocb_decrypt(&self, mut buf: &mut [u8]) -> u128 {
        let mut offset = self.aes_encrypt(self.decrypt_nonce.to_be());
        let mut checksum = 0u128;

        while buf.len() > BLOCK_SIZE {
            let (chunk, remainder) = buf.split_at_mut(BLOCK_SIZE);
            buf = remainder;
            let chunk: &mut [u8; BLOCK_SIZE] = chunk.try_into().expect("split_at works");

            offset = s2(offset);

            let encrypted = u128::from_be_bytes(*chunk);
            let plain = self.aes_decrypt(offset ^ encrypted) ^ offset;
            chunk.copy_from_slice(&plain.to_be_bytes());

            checksum ^= plain;
        }

        offset = s2(offset);

        let len = buf.len();
        assert!(len <= BLOCK_SIZE);
        let pad = self.aes_encrypt((len * 8) as u128 ^ offset);
        let mut block = [0; BLOCK_SIZE];
        block[..len].copy_from_slice(buf);
        let plain = u128::from_be_bytes(block) ^ pad;
        buf.copy_from_slice(&plain.to_be_bytes()[..len]);

        checksum ^= plain;

        self.aes_encrypt(offset ^ s2(offset) ^ checksum)
    }

    /// AES-128 encryption primitive.
    fn aes_encrypt(&self, data: u128) -> u128 {
        let mut data_bytes = data.to_be_bytes();
        let block = GenericArray::from_mut_slice(&mut data_bytes);
        self.aes.encrypt_block(block);

        u128::from_be_bytes(data_bytes)
    }

    /// AES-128 decryption primitive.
    fn aes_decrypt(&self, data: u128) -> u128 {
        let mut data_bytes = data.to_be_bytes();
        let block = GenericArray::from_mut_slice(&mut data_bytes);
        self.aes.decrypt_block(block);

        u128::from_be_bytes(data_bytes)
    }
}

#[inline]
fn s2(block: u128) -> u128 {
    let rot = block.rotate_left(1);
    let carry = rot & 1;
    rot ^ (carry * 0x86)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CryptState, CryptState) {
        let server = CryptState::default();
        let client = CryptState::new_from_setup(
            server.key,
            &server.get_decrypt_nonce(),
            &server.get_encrypt_nonce(),
        )
        .unwrap();

        (server, client)
    }

    fn seal(tx: &mut CryptState, plain: &[u8]) -> BytesMut {
        let mut frame = BytesMut::new();
        tx.encrypt(plain, &mut frame);
        frame
    }

    #[test]
    fn roundtrip_and_nonce_step() {
        let (mut client, mut server) = pair();

        for i in 0u8..5 {
            let plain = vec![i; 7 + i as usize * 16];
            let mut frame = seal(&mut client, &plain);
            server.decrypt(&mut frame).unwrap();
            assert_eq!(&frame[..], &plain[..]);
        }

        assert_eq!(server.good, 5);
        assert_eq!(client.get_encrypt_nonce(), server.get_decrypt_nonce());
    }

    #[test]
    fn duplicate_within_window_is_rejected_once() {
        let (mut client, mut server) = pair();

        let frame = seal(&mut client, b"payload");
        server.decrypt(&mut frame.clone()).unwrap();

        // the replay of an already-accepted frame must not be accepted again
        assert!(matches!(server.decrypt(&mut frame.clone()), Err(DecryptError::Repeat)));
        assert_eq!(server.good, 1);
    }

    #[test]
    fn late_packet_within_window_is_accepted() {
        let (mut client, mut server) = pair();

        let first = seal(&mut client, b"first");
        let second = seal(&mut client, b"second");

        server.decrypt(&mut second.clone()).unwrap();

        let mut late = first;
        server.decrypt(&mut late).unwrap();
        assert_eq!(&late[..], b"first");
        assert_eq!(server.late, 1);
    }

    #[test]
    fn far_out_of_window_is_late_error() {
        let (mut client, mut server) = pair();

        let stale = seal(&mut client, b"stale");

        for _ in 0..40 {
            let frame = seal(&mut client, b"fresh");
            server.decrypt(&mut frame.clone()).unwrap();
        }

        assert!(matches!(server.decrypt(&mut stale.clone()), Err(DecryptError::Late)));
    }

    #[test]
    fn corrupted_tag_is_rejected_and_nonce_restored(){
        let (mut client, mut server) = pair();

        let mut frame = seal(&mut client, b"payload");
        frame[1] ^= 0xff;
        assert!(matches!(server.decrypt(&mut frame), Err(DecryptError::Mac)));

        // an intact retransmission with the same nonce still decrypts
        let mut frame = BytesMut::new();
        client.reset();
        server.reset();
        client.encrypt(b"payload", &mut frame);
        server.decrypt(&mut frame).unwrap();
    }

    #[test]
    fn resync_restores_flow() {
        let (mut client, mut server) = pair();

        // client drifts: simulate by resetting only the client
        client.reset();
        let mut frame = seal(&mut client, b"after-reset");
        assert!(server.decrypt(&mut frame).is_err());

        // CryptSetup exchange: server adopts the client nonce
        server.set_decrypt_nonce(&client.get_encrypt_nonce());
        let mut frame = seal(&mut client, b"after-resync");
        server.decrypt(&mut frame).unwrap();
        assert_eq!(server.resync, 1);
    }
}
