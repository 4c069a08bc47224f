use std::hash::Hasher;
use std::net::SocketAddr;

use siphasher::sip::SipHasher13;

/// Keyed hash of a peer address, used as the connection table key.
///
/// The key is sampled once per host so remote peers cannot predict which addresses share a bucket.
pub struct AddrHasher {
    key: [u8; 16],
}

impl Default for AddrHasher {
    fn default() -> Self {
        // The thread-local RNG is a CSPRNG
        Self {
            key: rand::random(),
        }
    }
}

impl AddrHasher {
    pub fn hash(&self, addr: &SocketAddr) -> u64 {
        let mut hasher = SipHasher13::new_with_key(&self.key);

        match addr {
            SocketAddr::V4(addr) => {
                hasher.write_u8(4);
                hasher.write(&addr.ip().octets());
                hasher.write_u16(addr.port());
            }
            SocketAddr::V6(addr) => {
                hasher.write_u8(6);
                hasher.write(&addr.ip().octets());
                hasher.write_u16(addr.port());
            }
        }

        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_per_key() {
        let hasher = AddrHasher::default();

        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:5001".parse().unwrap();
        let c: SocketAddr = "[::ffff:10.0.0.1]:5000".parse().unwrap();

        assert_eq!(hasher.hash(&a), hasher.hash(&a));
        assert_ne!(hasher.hash(&a), hasher.hash(&b));
        assert_ne!(hasher.hash(&a), hasher.hash(&c));
    }
}
