//! Crypto as an opaque collaborator: the core
//! only ever calls these two traits. `XChaChaKeys` is the one concrete
//! implementation the crate ships so it is testable end to end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Result, TransportError};
use crate::msg::KeySlot;

#[derive(Clone)]
pub struct SessionKeys {
	pub even: [u8; 32],
	pub odd: [u8; 32],
}

/// The handshake-extension key-material negotiator.
pub trait KeyMaterial: Send + Sync {
	fn propose(&self) -> Vec<u8>;
	fn accept(&self, peer_bytes: &[u8]) -> Result<SessionKeys>;
}

/// The per-packet encrypt/decrypt hook.
pub trait PacketCrypto: Send + Sync {
	fn seal(&self, slot: KeySlot, plaintext: &[u8]) -> Vec<u8>;
	fn open(&self, slot: KeySlot, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// X25519 key agreement plus XChaCha20-Poly1305 AEAD, keyed separately for
/// the even/odd key-rotation slots carried in the message-number flags.
pub struct XChaChaKeys {
	secret: StaticSecret,
	keys: Mutex<Option<SessionKeys>>,
	have_keys: AtomicBool,
}

impl XChaChaKeys {
	pub fn new() -> Self {
		let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
		Self { secret, keys: Mutex::new(None), have_keys: AtomicBool::new(false) }
	}

	fn cipher_for(&self, slot: KeySlot) -> Option<XChaCha20Poly1305> {
		if !self.have_keys.load(Ordering::Acquire) {
			return None;
		}
		let keys = self.keys.lock().unwrap();
		let keys = keys.as_ref()?;
		let bytes = match slot {
			KeySlot::Even => keys.even,
			KeySlot::Odd => keys.odd,
			KeySlot::None => return None,
		};
		Some(XChaCha20Poly1305::new(Key::from_slice(&bytes)))
	}
}

impl Default for XChaChaKeys {
	fn default() -> Self {
		Self::new()
	}
}

impl KeyMaterial for XChaChaKeys {
	fn propose(&self) -> Vec<u8> {
		PublicKey::from(&self.secret).as_bytes().to_vec()
	}

	fn accept(&self, peer_bytes: &[u8]) -> Result<SessionKeys> {
		if peer_bytes.len() != 32 {
			return Err(TransportError::Setup("key-material payload must be 32 bytes".to_string()));
		}
		let mut arr = [0u8; 32];
		arr.copy_from_slice(peer_bytes);
		let shared = self.secret.diffie_hellman(&PublicKey::from(arr));
		let shared = shared.as_bytes();

		let mut even = [0u8; 32];
		let mut odd = [0u8; 32];
		for i in 0..32 {
			even[i] = shared[i];
			odd[i] = shared[i] ^ 0xFF;
		}
		let keys = SessionKeys { even, odd };

		*self.keys.lock().unwrap() = Some(keys.clone());
		self.have_keys.store(true, Ordering::Release);
		Ok(keys)
	}
}

impl PacketCrypto for XChaChaKeys {
	fn seal(&self, slot: KeySlot, plaintext: &[u8]) -> Vec<u8> {
		let Some(cipher) = self.cipher_for(slot) else {
			return plaintext.to_vec();
		};

		let mut nonce_bytes = [0u8; 24];
		rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
		let nonce = XNonce::from_slice(&nonce_bytes);

		match cipher.encrypt(nonce, plaintext) {
			Ok(mut body) => {
				let mut sealed = nonce_bytes.to_vec();
				sealed.append(&mut body);
				sealed
			}
			Err(_) => {
				log::error!("payload too large to seal, dropping");
				Vec::new()
			}
		}
	}

	fn open(&self, slot: KeySlot, ciphertext: &[u8]) -> Result<Vec<u8>> {
		let cipher = self
			.cipher_for(slot)
			.ok_or_else(|| TransportError::NotSup("no session key for slot".to_string()))?;

		if ciphertext.len() < 24 {
			return Err(TransportError::Malformed);
		}
		let (nonce_bytes, body) = ciphertext.split_at(24);
		let nonce = XNonce::from_slice(nonce_bytes);
		cipher.decrypt(nonce, body).map_err(|_| TransportError::Setup("AEAD authentication failed".to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_exchange_and_seal_open_roundtrip() {
		let alice = XChaChaKeys::new();
		let bob = XChaChaKeys::new();

		let alice_keys = alice.accept(&bob.propose()).unwrap();
		let bob_keys = bob.accept(&alice.propose()).unwrap();
		assert_eq!(alice_keys.even, bob_keys.even);
		assert_eq!(alice_keys.odd, bob_keys.odd);

		let sealed = alice.seal(KeySlot::Even, b"hello");
		let opened = bob.open(KeySlot::Even, &sealed).unwrap();
		assert_eq!(opened, b"hello");
	}

	#[test]
	fn open_rejects_tampered_ciphertext() {
		let alice = XChaChaKeys::new();
		let bob = XChaChaKeys::new();
		alice.accept(&bob.propose()).unwrap();
		bob.accept(&alice.propose()).unwrap();

		let mut sealed = alice.seal(KeySlot::Odd, b"payload");
		let last = sealed.len() - 1;
		sealed[last] ^= 0xFF;
		assert!(bob.open(KeySlot::Odd, &sealed).is_err());
	}

	#[test]
	fn seal_without_keys_passes_through() {
		let k = XChaChaKeys::new();
		assert_eq!(k.seal(KeySlot::None, b"plain"), b"plain");
	}
}
