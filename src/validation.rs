/// Proposal validation
///
/// Checks applied to a deal proposal before it is submitted for admission.
/// Each check returns `ProvdError::Validation` with a human-readable reason;
/// the provider turns that reason into a rejection rather than an error.
use crate::domain::ProviderDeal;
use crate::error::{ProvdError, Result};
use crate::provider::ProviderConfig;
use rust_decimal::Decimal;

/// Validate piece size (non-zero power of two, within the configured maximum)
///
/// # Arguments
/// * `piece_size` - Padded piece size in bytes
/// * `max_piece_size` - Largest piece the provider stores
pub fn validate_piece_size(piece_size: u64, max_piece_size: u64) -> Result<()> {
    if piece_size == 0 || !piece_size.is_power_of_two() {
        return Err(ProvdError::Validation(format!(
            "proposal piece size {} is not a power of two",
            piece_size
        )));
    }

    if piece_size > max_piece_size {
        return Err(ProvdError::Validation(format!(
            "proposal piece size {} exceeds maximum {}",
            piece_size, max_piece_size
        )));
    }

    Ok(())
}

/// Validate deal epochs and duration bounds
pub fn validate_duration(start_epoch: i64, end_epoch: i64, min: i64, max: i64) -> Result<()> {
    if start_epoch < 0 {
        return Err(ProvdError::Validation(format!(
            "proposal start epoch {} cannot be negative",
            start_epoch
        )));
    }

    if end_epoch <= start_epoch {
        return Err(ProvdError::Validation(format!(
            "proposal end epoch {} must be after start epoch {}",
            end_epoch, start_epoch
        )));
    }

    let duration = end_epoch - start_epoch;
    if duration < min || duration > max {
        return Err(ProvdError::Validation(format!(
            "deal duration {} out of bounds (min, max) = ({}, {})",
            duration, min, max
        )));
    }

    Ok(())
}

/// Validate that an amount is not negative
pub fn validate_amount(amount: Decimal, field_name: &str) -> Result<()> {
    if amount < Decimal::ZERO {
        return Err(ProvdError::Validation(format!(
            "{} cannot be negative: {}",
            field_name, amount
        )));
    }
    Ok(())
}

/// Run every proposal check for a deal addressed to this provider
pub fn validate_deal(config: &ProviderConfig, deal: &ProviderDeal) -> Result<()> {
    let signed = &deal.client_deal_proposal;
    let proposal = &signed.proposal;

    if signed.client_signature.trim().is_empty() {
        return Err(ProvdError::Validation(
            "proposal is missing the client signature".to_string(),
        ));
    }

    if proposal.provider != config.address {
        return Err(ProvdError::Validation(format!(
            "incorrect provider for deal; proposal.Provider: {}; provider.Address: {}",
            proposal.provider, config.address
        )));
    }

    validate_piece_size(proposal.piece_size, config.max_piece_size)?;

    if deal.transfer.size > proposal.piece_size {
        return Err(ProvdError::Validation(format!(
            "deal size {} is larger than piece size {}",
            deal.transfer.size, proposal.piece_size
        )));
    }

    validate_duration(
        proposal.start_epoch,
        proposal.end_epoch,
        config.min_deal_duration,
        config.max_deal_duration,
    )?;

    validate_amount(proposal.storage_price_per_epoch, "storage price per epoch")?;
    validate_amount(proposal.provider_collateral, "provider collateral")?;
    validate_amount(proposal.client_collateral, "client collateral")?;

    if !deal.is_offline
        && deal
            .transfer
            .url
            .as_deref()
            .map_or(true, |url| url.trim().is_empty())
    {
        return Err(ProvdError::Validation(
            "online deal is missing a transfer url".to_string(),
        ));
    }

    Ok(())
}
