use crate::error::VerificationError;
use crate::receipt::Receipt;
use crate::signing;

/// Check that `receipt` came from `expected_miner` and carries valid
/// signatures from both the miner and the validator.
///
/// Checks run in that order and stop at the first failure.
pub fn verify_receipt(receipt: &Receipt, expected_miner: &str) -> Result<(), VerificationError> {
    let payload = &receipt.payload;
    if payload.miner_hotkey != expected_miner {
        return Err(VerificationError::PeerMismatch);
    }

    let blob = payload.blob_for_signing();
    if !signing::verify(&payload.miner_hotkey, blob.as_bytes(), &receipt.miner_signature) {
        return Err(VerificationError::BadMinerSignature);
    }
    if !signing::verify(&payload.validator_hotkey, blob.as_bytes(), &receipt.validator_signature) {
        return Err(VerificationError::BadValidatorSignature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::{ExecutorClass, ReceiptPayload};
    use crate::signing::Hotkey;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn signed_receipt(miner: &Hotkey, validator: &Hotkey) -> Receipt {
        let payload = ReceiptPayload {
            job_uuid: Uuid::parse_str("0e93c887-879f-4332-a807-a42f42dfd73d").unwrap(),
            miner_hotkey: miner.ss58_address(),
            validator_hotkey: validator.ss58_address(),
            time_started: Utc.with_ymd_and_hms(2024, 5, 18, 0, 0, 12).unwrap(),
            time_took_us: 27644673,
            score_str: "1.692837".into(),
            executor_class: ExecutorClass::default(),
        };
        let blob = payload.blob_for_signing();
        Receipt {
            miner_signature: miner.sign(blob.as_bytes()),
            validator_signature: validator.sign(blob.as_bytes()),
            payload,
        }
    }

    fn flip_hex_char(sig: &str, index: usize) -> String {
        let mut chars: Vec<char> = sig.chars().collect();
        chars[index] = if chars[index] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    #[test]
    fn valid_receipt_passes() {
        let (miner, validator) = (Hotkey::from_seed([1; 32]), Hotkey::from_seed([2; 32]));
        let receipt = signed_receipt(&miner, &validator);
        assert_eq!(verify_receipt(&receipt, &miner.ss58_address()), Ok(()));
    }

    #[test]
    fn other_miner_is_a_mismatch() {
        let (miner, validator) = (Hotkey::from_seed([1; 32]), Hotkey::from_seed([2; 32]));
        let receipt = signed_receipt(&miner, &validator);
        let other = Hotkey::from_seed([3; 32]).ss58_address();
        assert_eq!(verify_receipt(&receipt, &other), Err(VerificationError::PeerMismatch));
    }

    #[test]
    fn swapped_signatures_fail_on_miner_first() {
        let (miner, validator) = (Hotkey::from_seed([1; 32]), Hotkey::from_seed([2; 32]));
        let mut receipt = signed_receipt(&miner, &validator);
        std::mem::swap(&mut receipt.miner_signature, &mut receipt.validator_signature);
        assert_eq!(
            verify_receipt(&receipt, &miner.ss58_address()),
            Err(VerificationError::BadMinerSignature)
        );
    }

    #[test]
    fn tampered_payload_fails() {
        let (miner, validator) = (Hotkey::from_seed([1; 32]), Hotkey::from_seed([2; 32]));
        let mut receipt = signed_receipt(&miner, &validator);
        receipt.payload.score_str = "9.999999".into();
        assert_eq!(
            verify_receipt(&receipt, &miner.ss58_address()),
            Err(VerificationError::BadMinerSignature)
        );
    }

    #[test]
    fn validator_signed_by_wrong_key_fails() {
        let (miner, validator) = (Hotkey::from_seed([1; 32]), Hotkey::from_seed([2; 32]));
        let mut receipt = signed_receipt(&miner, &validator);
        receipt.validator_signature = Hotkey::from_seed([4; 32]).sign(receipt.payload.blob_for_signing().as_bytes());
        assert_eq!(
            verify_receipt(&receipt, &miner.ss58_address()),
            Err(VerificationError::BadValidatorSignature)
        );
    }

    proptest! {
        #[test]
        fn any_flipped_signature_char_fails(index in 2usize..130, miner_side in any::<bool>()) {
            let (miner, validator) = (Hotkey::from_seed([1; 32]), Hotkey::from_seed([2; 32]));
            let mut receipt = signed_receipt(&miner, &validator);
            let expected = if miner_side {
                receipt.miner_signature = flip_hex_char(&receipt.miner_signature, index);
                VerificationError::BadMinerSignature
            } else {
                receipt.validator_signature = flip_hex_char(&receipt.validator_signature, index);
                VerificationError::BadValidatorSignature
            };
            prop_assert_eq!(verify_receipt(&receipt, &miner.ss58_address()), Err(expected));
        }
    }
}
