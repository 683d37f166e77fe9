//! Output script classification and extraction of probable key-hash
//! elements, used to drive account index matching.

use bitcoin::blockdata::script::Instruction;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::{Script, Witness};

/// The shape of an output script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptPattern {
    /// OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    PayToPubkeyHash,
    /// OP_HASH160 <20> OP_EQUAL
    PayToScriptHash,
    /// m <pubkey>.. n OP_CHECKMULTISIG
    PayToMultisig,
    /// <pubkey> OP_CHECKSIG
    PayToPubkey,
    /// OP_RETURN data carrier
    NullData,
    /// Version-0 witness program (20 or 32 byte)
    SegwitV0,
    /// Version-1 witness program (taproot)
    Taproot,
    /// Anything else
    Custom,
}

/// Classify an output script into one of the known patterns.
pub fn classify(script: &Script) -> ScriptPattern {
    if script.is_p2pkh() {
        ScriptPattern::PayToPubkeyHash
    } else if script.is_p2sh() {
        ScriptPattern::PayToScriptHash
    } else if script.is_multisig() {
        ScriptPattern::PayToMultisig
    } else if script.is_p2pk() {
        ScriptPattern::PayToPubkey
    } else if script.is_op_return() {
        ScriptPattern::NullData
    } else if script.is_p2wpkh() || script.is_p2wsh() {
        ScriptPattern::SegwitV0
    } else if script.is_p2tr() {
        ScriptPattern::Taproot
    } else {
        ScriptPattern::Custom
    }
}

/// Extract the probable key-hash byte strings from an output script.
///
/// Key-bearing patterns yield the hash the script commits to; raw-key
/// patterns yield the HASH160 of each embedded key so everything matches
/// against the index in one representation. Patterns that commit to no key
/// yield nothing.
pub fn extract_elements(script: &Script) -> Vec<Vec<u8>> {
    let bytes = script.as_bytes();
    match classify(script) {
        ScriptPattern::PayToPubkeyHash => vec![bytes[3..23].to_vec()],
        ScriptPattern::PayToScriptHash => vec![bytes[2..22].to_vec()],
        ScriptPattern::SegwitV0 | ScriptPattern::Taproot => vec![bytes[2..].to_vec()],
        ScriptPattern::PayToPubkey | ScriptPattern::PayToMultisig => pushed_key_hashes(script),
        ScriptPattern::NullData | ScriptPattern::Custom => Vec::new(),
    }
}

/// Extract probable key-hash byte strings from the spending side of an
/// input: HASH160 of every plausible public key pushed in the signature
/// script or the witness. This is what lets a spend be recognised even when
/// the output it consumes was never observed.
pub fn extract_input_elements(script_sig: &Script, witness: &Witness) -> Vec<Vec<u8>> {
    let mut elements = pushed_key_hashes(script_sig);
    for item in witness.iter() {
        if looks_like_pubkey(item) {
            elements.push(hash160::Hash::hash(item).to_byte_array().to_vec());
        }
    }
    elements
}

// HASH160 of every push in the script that is shaped like a public key.
fn pushed_key_hashes(script: &Script) -> Vec<Vec<u8>> {
    script
        .instructions()
        .filter_map(|instruction| match instruction {
            Ok(Instruction::PushBytes(push)) if looks_like_pubkey(push.as_bytes()) => {
                Some(hash160::Hash::hash(push.as_bytes()).to_byte_array().to_vec())
            }
            _ => None,
        })
        .collect()
}

fn looks_like_pubkey(bytes: &[u8]) -> bool {
    matches!(
        (bytes.len(), bytes.first()),
        (33, Some(0x02)) | (33, Some(0x03)) | (65, Some(0x04))
    )
}

#[cfg(test)]
mod tests {
    use bitcoin::script::PushBytesBuf;
    use bitcoin::{opcodes, PubkeyHash, ScriptBuf, WPubkeyHash};

    use super::*;

    fn fake_pubkey(lead: u8) -> Vec<u8> {
        let mut key = vec![0x11u8; 33];
        key[0] = lead;
        key
    }

    #[test]
    fn classifies_p2pkh_and_extracts_hash() {
        let hash = PubkeyHash::from_byte_array([0xab; 20]);
        let script = ScriptBuf::new_p2pkh(&hash);
        assert_eq!(classify(&script), ScriptPattern::PayToPubkeyHash);
        assert_eq!(extract_elements(&script), vec![vec![0xab; 20]]);
    }

    #[test]
    fn classifies_p2wpkh_and_extracts_program() {
        let hash = WPubkeyHash::from_byte_array([0xcd; 20]);
        let script = ScriptBuf::new_p2wpkh(&hash);
        assert_eq!(classify(&script), ScriptPattern::SegwitV0);
        assert_eq!(extract_elements(&script), vec![vec![0xcd; 20]]);
    }

    #[test]
    fn classifies_null_data_with_no_elements() {
        let script = ScriptBuf::new_op_return(PushBytesBuf::try_from(vec![1, 2, 3]).unwrap());
        assert_eq!(classify(&script), ScriptPattern::NullData);
        assert!(extract_elements(&script).is_empty());
    }

    #[test]
    fn p2pk_extracts_key_hash() {
        let key = fake_pubkey(0x02);
        let mut builder = bitcoin::script::Builder::new();
        builder = builder.push_slice(PushBytesBuf::try_from(key.clone()).unwrap());
        let script = builder.push_opcode(opcodes::all::OP_CHECKSIG).into_script();
        assert_eq!(classify(&script), ScriptPattern::PayToPubkey);

        let expected = hash160::Hash::hash(&key).to_byte_array().to_vec();
        assert_eq!(extract_elements(&script), vec![expected]);
    }

    #[test]
    fn witness_pubkey_extracted_from_input() {
        let key = fake_pubkey(0x03);
        let mut witness = Witness::new();
        witness.push(vec![0u8; 71]); // signature-shaped, ignored
        witness.push(key.clone());

        let script_sig = ScriptBuf::new();
        let elements = extract_input_elements(&script_sig, &witness);
        let expected = hash160::Hash::hash(&key).to_byte_array().to_vec();
        assert_eq!(elements, vec![expected]);
    }

    #[test]
    fn garbage_script_is_custom() {
        let script = ScriptBuf::from_bytes(vec![0x6b, 0xff, 0xfe]);
        assert_eq!(classify(&script), ScriptPattern::Custom);
        assert!(extract_elements(&script).is_empty());
    }
}
