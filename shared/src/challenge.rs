//! Challenge tokens: sealed by the server, echoed back by the client.

use crate::crypto::{self, Key};
use crate::error::{NetcodeError, Result};
use crate::{CHALLENGE_TOKEN_BYTES, MAC_BYTES, USER_DATA_BYTES};
use serde::{Deserialize, Serialize};

/// Identity the server re-asserts during the second round trip
///
/// Only the server holds the challenge key, so the client can forward the
/// sealed bytes but never read or forge them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeToken {
    pub client_id: u64,
    pub user_data: Vec<u8>,
}

impl ChallengeToken {
    pub fn new(client_id: u64, user_data: Vec<u8>) -> Self {
        Self {
            client_id,
            user_data,
        }
    }

    /// Seals the token into exactly `CHALLENGE_TOKEN_BYTES`
    pub fn seal(&self, sequence: u64, key: &Key) -> Result<Vec<u8>> {
        if self.user_data.len() > USER_DATA_BYTES {
            return Err(NetcodeError::InvalidChallengeToken);
        }

        let mut plaintext = bincode::serialize(self)?;
        plaintext.resize(CHALLENGE_TOKEN_BYTES - MAC_BYTES, 0);
        crypto::seal(&plaintext, key, sequence, &[])
    }

    pub fn open(sealed: &[u8], sequence: u64, key: &Key) -> Result<Self> {
        if sealed.len() != CHALLENGE_TOKEN_BYTES {
            return Err(NetcodeError::InvalidChallengeToken);
        }

        let plaintext =
            crypto::open(sealed, key, sequence, &[]).map_err(|_| NetcodeError::InvalidChallengeToken)?;
        let token: Self =
            bincode::deserialize(&plaintext).map_err(|_| NetcodeError::InvalidChallengeToken)?;

        if token.user_data.len() > USER_DATA_BYTES {
            return Err(NetcodeError::InvalidChallengeToken);
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = crypto::generate_key();
        let token = ChallengeToken::new(0x1234, vec![9; USER_DATA_BYTES]);

        let sealed = token.seal(3, &key).unwrap();
        assert_eq!(sealed.len(), CHALLENGE_TOKEN_BYTES);
        assert_eq!(ChallengeToken::open(&sealed, 3, &key).unwrap(), token);
    }

    #[test]
    fn test_open_with_wrong_sequence_or_key() {
        let key = crypto::generate_key();
        let sealed = ChallengeToken::new(1, vec![]).seal(3, &key).unwrap();

        assert!(ChallengeToken::open(&sealed, 4, &key).is_err());
        assert!(ChallengeToken::open(&sealed, 3, &crypto::generate_key()).is_err());
        assert!(ChallengeToken::open(&sealed[1..], 3, &key).is_err());
    }
}
