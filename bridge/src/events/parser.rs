// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Decoding of custody contract logs into [`SourceEvent`]s.
//!
//! Parsing is purely structural. Whether a token is known is decided later
//! by the classifier, so every non-native token in a `TokenBurn` log comes
//! out of here as a [`TokenDeposit`].

use super::{
    NativeDeposit, RawLog, SourceEvent, TokenDeposit, WrappedDeployed, DEPOSIT_LOG_TOPIC,
    TOKEN_BURN_TOPIC, WRAPPED_TOKEN_DEPLOYED_TOPIC,
};
use crate::types::{BlockNumber, EventSource, Principal, Subaccount};
use ethers::types::{Address, H256, U256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseLogError {
    /// The log is not yet included in a block; it will be seen again once it is.
    #[error("pending log: {0}")]
    PendingLog(String),
    #[error("invalid event {event_source} at block {block_number}: {reason}")]
    InvalidEvent {
        event_source: EventSource,
        block_number: BlockNumber,
        reason: String,
    },
}

pub fn parse_log(log: &RawLog) -> Result<SourceEvent, ParseLogError> {
    let (block_number, source) = ensure_not_pending(log)?;
    let invalid = |reason: String| ParseLogError::InvalidEvent {
        event_source: source,
        block_number,
        reason,
    };
    if log.removed {
        return Err(invalid(
            "this event has been removed from the chain".to_string(),
        ));
    }
    let EventSource {
        transaction_hash,
        log_index,
    } = source;

    match log.topics.first() {
        Some(signature) if *signature == DEPOSIT_LOG_TOPIC => {
            // DepositLog(
            //     address from_address,
            //     address indexed token,
            //     uint256 indexed amount,
            //     bytes32 indexed principal,
            //     bytes32 subaccount
            // )
            ensure_topic_count(log, 4).map_err(invalid)?;
            let [from_word, subaccount_word] = parse_data_words::<2>(log).map_err(invalid)?;
            let from_address = parse_address(&from_word).map_err(invalid)?;
            let token = parse_address(&log.topics[1].0).map_err(invalid)?;
            let value = U256::from_big_endian(log.topics[2].as_bytes());
            let principal = parse_principal(&log.topics[3].0).map_err(invalid)?;
            let subaccount = Subaccount::from_bytes(subaccount_word);
            Ok(deposit(
                transaction_hash,
                block_number,
                log_index,
                from_address,
                value,
                principal,
                subaccount,
                token,
            ))
        }
        Some(signature) if *signature == TOKEN_BURN_TOPIC => {
            // TokenBurn(
            //     address indexed fromAddress,
            //     uint256 amount,
            //     bytes32 indexed recipient,
            //     address indexed tokenAddress,
            //     bytes32 subaccount
            // )
            ensure_topic_count(log, 4).map_err(invalid)?;
            let from_address = parse_address(&log.topics[1].0).map_err(invalid)?;
            let [amount_word, subaccount_word] = parse_data_words::<2>(log).map_err(invalid)?;
            let principal = parse_principal(&log.topics[2].0).map_err(invalid)?;
            let token = parse_address(&log.topics[3].0).map_err(invalid)?;
            Ok(deposit(
                transaction_hash,
                block_number,
                log_index,
                from_address,
                U256::from_big_endian(&amount_word),
                principal,
                Subaccount::from_bytes(subaccount_word),
                token,
            ))
        }
        Some(signature) if *signature == WRAPPED_TOKEN_DEPLOYED_TOPIC => {
            // WrappedTokenDeployed(bytes32 indexed baseToken, address indexed wrappedERC20)
            ensure_topic_count(log, 3).map_err(invalid)?;
            let base_ledger = parse_principal(&log.topics[1].0).map_err(invalid)?;
            let wrapped_contract_address = parse_address(&log.topics[2].0).map_err(invalid)?;
            Ok(SourceEvent::WrappedDeployed(WrappedDeployed {
                transaction_hash,
                block_number,
                log_index,
                base_ledger,
                wrapped_contract_address,
            }))
        }
        _ => Err(invalid(format!(
            "Invalid event signature: {:?}",
            log.topics.first()
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
fn deposit(
    transaction_hash: H256,
    block_number: BlockNumber,
    log_index: u64,
    from_address: Address,
    value: U256,
    principal: Principal,
    subaccount: Option<Subaccount>,
    token: Address,
) -> SourceEvent {
    if token.is_zero() {
        SourceEvent::NativeDeposit(NativeDeposit {
            transaction_hash,
            block_number,
            log_index,
            from_address,
            value,
            principal,
            subaccount,
        })
    } else {
        SourceEvent::TokenDeposit(TokenDeposit {
            transaction_hash,
            block_number,
            log_index,
            from_address,
            value,
            principal,
            subaccount,
            token_contract_address: token,
        })
    }
}

fn ensure_not_pending(log: &RawLog) -> Result<(BlockNumber, EventSource), ParseLogError> {
    let missing = |field: &str| ParseLogError::PendingLog(format!("log {:?} has no {field}", log));
    if log.block_hash.is_none() {
        return Err(missing("block hash"));
    }
    let block_number = log.block_number.ok_or_else(|| missing("block number"))?;
    let transaction_hash = log.transaction_hash.ok_or_else(|| missing("transaction hash"))?;
    let log_index = log.log_index.ok_or_else(|| missing("log index"))?;
    Ok((
        block_number,
        EventSource {
            transaction_hash,
            log_index,
        },
    ))
}

fn ensure_topic_count(log: &RawLog, expected: usize) -> Result<(), String> {
    if log.topics.len() != expected {
        return Err(format!(
            "expected {expected} topics, got {}",
            log.topics.len()
        ));
    }
    Ok(())
}

fn parse_data_words<const N: usize>(log: &RawLog) -> Result<[[u8; 32]; N], String> {
    let data = log.data.as_ref();
    if data.len() != 32 * N {
        return Err(format!(
            "expected {} bytes of data, got {}",
            32 * N,
            data.len()
        ));
    }
    let mut words = [[0u8; 32]; N];
    for (word, chunk) in words.iter_mut().zip(data.chunks_exact(32)) {
        word.copy_from_slice(chunk);
    }
    Ok(words)
}

/// A 32-byte word holding a left-padded 20-byte address.
fn parse_address(word: &[u8; 32]) -> Result<Address, String> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(format!("address word has non-zero padding: 0x{}", hex::encode(word)));
    }
    Ok(Address::from_slice(&word[12..]))
}

/// A principal packed in a 32-byte word: the first byte is the length,
/// followed by the principal bytes and zero padding.
pub fn parse_principal(word: &[u8; 32]) -> Result<Principal, String> {
    let num_bytes = word[0] as usize;
    if num_bytes == 0 {
        return Err("management canister principal is not allowed".to_string());
    }
    if num_bytes > Principal::MAX_LENGTH {
        return Err(format!(
            "invalid number of bytes: expected a number in the range [1,{}], got {num_bytes}",
            Principal::MAX_LENGTH
        ));
    }
    let (principal_bytes, trailing) = word[1..].split_at(num_bytes);
    if trailing.iter().any(|b| *b != 0) {
        return Err("trailing non-zero bytes".to_string());
    }
    let principal = Principal::try_from_slice(principal_bytes).map_err(|e| e.to_string())?;
    if principal.is_anonymous() {
        return Err("anonymous principal is not allowed".to_string());
    }
    Ok(principal)
}

/// Inverse of [`parse_principal`].
pub fn encode_principal(principal: &Principal) -> [u8; 32] {
    let bytes = principal.as_slice();
    let mut word = [0u8; 32];
    word[0] = bytes.len() as u8;
    word[1..=bytes.len()].copy_from_slice(bytes);
    word
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        address_word, deployed_log, principal_with_id, token_burn_log, LogBuilder,
    };

    #[test]
    fn test_parse_native_token_burn_log() {
        let principal = principal_with_id(7);
        let log = token_burn_log(100, 0, U256::from(1_000u64), principal, Address::zero());
        match parse_log(&log).unwrap() {
            SourceEvent::NativeDeposit(deposit) => {
                assert_eq!(deposit.value, U256::from(1_000u64));
                assert_eq!(deposit.principal, principal);
                assert_eq!(deposit.block_number, 100);
                assert_eq!(deposit.subaccount, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_token_burn_with_token_address() {
        let token = Address::repeat_byte(0x55);
        let log = token_burn_log(5, 3, U256::from(9u64), principal_with_id(1), token);
        match parse_log(&log).unwrap() {
            SourceEvent::TokenDeposit(deposit) => {
                assert_eq!(deposit.token_contract_address, token);
                assert_eq!(deposit.log_index, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_legacy_deposit_log() {
        let principal = principal_with_id(2);
        let mut subaccount = [0u8; 32];
        subaccount[31] = 9;
        let mut data = address_word(Address::repeat_byte(0x11)).to_vec();
        data.extend_from_slice(&subaccount);
        let log = LogBuilder::new(12, 1)
            .topics(vec![
                DEPOSIT_LOG_TOPIC,
                H256(address_word(Address::zero())),
                H256::from_low_u64_be(500),
                H256(encode_principal(&principal)),
            ])
            .data(data)
            .build();
        match parse_log(&log).unwrap() {
            SourceEvent::NativeDeposit(deposit) => {
                assert_eq!(deposit.from_address, Address::repeat_byte(0x11));
                assert_eq!(deposit.value, U256::from(500u64));
                assert_eq!(deposit.subaccount, Some(Subaccount(subaccount)));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_wrapped_deployed_log() {
        let log = deployed_log(20, 0, principal_with_id(3), Address::repeat_byte(0x77));
        match parse_log(&log).unwrap() {
            SourceEvent::WrappedDeployed(event) => {
                assert_eq!(event.base_ledger, principal_with_id(3));
                assert_eq!(event.wrapped_contract_address, Address::repeat_byte(0x77));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_pending_log_is_not_an_event() {
        let mut log = token_burn_log(1, 0, U256::one(), principal_with_id(1), Address::zero());
        log.block_hash = None;
        assert!(matches!(parse_log(&log), Err(ParseLogError::PendingLog(_))));
        let mut log = token_burn_log(1, 0, U256::one(), principal_with_id(1), Address::zero());
        log.log_index = None;
        assert!(matches!(parse_log(&log), Err(ParseLogError::PendingLog(_))));
    }

    #[test]
    fn test_removed_log_is_invalid() {
        let mut log = token_burn_log(1, 0, U256::one(), principal_with_id(1), Address::zero());
        log.removed = true;
        match parse_log(&log) {
            Err(ParseLogError::InvalidEvent {
                event_source,
                block_number,
                reason,
            }) => {
                assert_eq!(Some(event_source.log_index), log.log_index);
                assert_eq!(Some(event_source.transaction_hash), log.transaction_hash);
                assert_eq!(Some(block_number), log.block_number);
                assert_eq!(reason, "this event has been removed from the chain")
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_unknown_signature_is_invalid() {
        let log = LogBuilder::new(1, 0)
            .topics(vec![H256::repeat_byte(0xaa)])
            .build();
        match parse_log(&log) {
            Err(ParseLogError::InvalidEvent { reason, .. }) => {
                assert!(reason.starts_with("Invalid event signature"))
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_data_length_must_be_whole_words() {
        let mut log = token_burn_log(1, 0, U256::one(), principal_with_id(1), Address::zero());
        let mut data = log.data.to_vec();
        data.push(0);
        log.data = data.into();
        assert!(matches!(
            parse_log(&log),
            Err(ParseLogError::InvalidEvent { .. })
        ));
    }

    #[test]
    fn test_parse_principal_rules() {
        let mut word = [0u8; 32];
        assert!(parse_principal(&word).unwrap_err().contains("management"));

        word[0] = 30;
        assert!(parse_principal(&word).unwrap_err().contains("range [1,29]"));

        word[0] = 1;
        word[1] = 4;
        assert!(parse_principal(&word).unwrap_err().contains("anonymous"));

        word[1] = 9;
        word[5] = 1;
        assert_eq!(parse_principal(&word).unwrap_err(), "trailing non-zero bytes");

        word[5] = 0;
        assert_eq!(
            parse_principal(&word).unwrap(),
            Principal::try_from_slice(&[9]).unwrap()
        );
    }

    #[test]
    fn test_encode_principal_round_trip() {
        let principal = Principal::try_from_slice(&[1u8; 29]).unwrap();
        assert_eq!(parse_principal(&encode_principal(&principal)).unwrap(), principal);
    }
}
