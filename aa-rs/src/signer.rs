use crate::account::ECDSA_SIGNATURE_LEN;
use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature};

/// Signs the userOpHash the way SimpleAccount validates it: an EIP-191 personal message over
/// the 32 raw hash bytes.
pub async fn sign_user_operation(
    wallet: &LocalWallet,
    op: &UserOperation,
    entry_point: Address,
    chain_id: u64,
) -> Result<Bytes> {
    let user_op_hash = op.hash(entry_point, chain_id);

    let sig = wallet
        .sign_message(user_op_hash.as_bytes())
        .await
        .context("failed to sign userOpHash")?;

    Ok(Bytes::from(sig.to_vec()))
}

/// Recovers the signer of `op.signature` and checks it is `owner`.
pub fn verify_user_operation_signature(
    op: &UserOperation,
    entry_point: Address,
    chain_id: u64,
    owner: Address,
) -> Result<()> {
    if op.signature.len() != ECDSA_SIGNATURE_LEN {
        return Err(anyhow!(
            "signature must be {} bytes, got {}",
            ECDSA_SIGNATURE_LEN,
            op.signature.len()
        ));
    }
    let sig = Signature::try_from(op.signature.as_ref()).context("malformed signature")?;
    let user_op_hash = op.hash(entry_point, chain_id);
    sig.verify(user_op_hash.as_bytes(), owner)
        .with_context(|| format!("signature does not recover to owner {owner:?}"))
}
