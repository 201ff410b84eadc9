use rand::rngs::OsRng;
use rand::RngCore;

use crate::CryptoError;

#[cfg(test)]
thread_local! {
    static OUTAGE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Makes every random draw on this thread fail until dropped.
#[cfg(test)]
pub(crate) struct RandomOutage;

#[cfg(test)]
impl RandomOutage {
    pub(crate) fn begin() -> Self {
        OUTAGE.with(|o| o.set(true));
        Self
    }
}

#[cfg(test)]
impl Drop for RandomOutage {
    fn drop(&mut self) {
        OUTAGE.with(|o| o.set(false));
    }
}

/// Fill a buffer from the OS random source.
///
/// Fails with `CryptoUnavailable` instead of panicking when the host has no
/// usable entropy source.
pub(crate) fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    #[cfg(test)]
    if OUTAGE.with(std::cell::Cell::get) {
        return Err(CryptoError::CryptoUnavailable(
            "secure random source: outage".into(),
        ));
    }

    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::CryptoUnavailable(format!("secure random source: {e}")))?;
    Ok(buf)
}

/// Draw once from the random source at startup.
pub fn check_crypto_available() -> Result<(), CryptoError> {
    random_bytes::<32>().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outage_fails_draws_until_dropped() {
        {
            let _outage = RandomOutage::begin();
            assert!(matches!(
                check_crypto_available(),
                Err(CryptoError::CryptoUnavailable(_))
            ));
        }
        assert!(check_crypto_available().is_ok());
    }
}
