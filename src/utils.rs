use rand::Rng;

/// Generates a random token of size N bytes, encoded in base58.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> eyre::Result<String> {
    let mut token = [0u8; N];
    rng.try_fill_bytes(&mut token)?;
    Ok(bs58::encode(token).into_string())
}

/// Token ids issued by the admin surface: `{chain_id}-{random}`.
pub fn new_token_id(chain_id: u64) -> eyre::Result<String> {
    Ok(format!("{chain_id}-{}", generate_token::<12>(rand::thread_rng())?))
}

/// Chain id encoded in a token id issued by [`new_token_id`].
pub fn chain_of(token_id: &str) -> eyre::Result<u64> {
    let (chain, _) = token_id
        .split_once('-')
        .ok_or_else(|| eyre::eyre!("token id {token_id} carries no chain id"))?;

    Ok(chain.parse()?)
}
