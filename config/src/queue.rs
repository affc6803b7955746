use anyhow::Result;

/// Separates the sequence number from the job id in ready-set members.
pub const MEMBER_SEPARATOR: char = '|';

/// Rejects names that would produce ambiguous store keys.
pub fn validate_name(label: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{label} cannot be empty");
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        anyhow::bail!("{label} cannot contain whitespace or control characters");
    }
    if value.contains(MEMBER_SEPARATOR) {
        anyhow::bail!("{label} cannot contain '{MEMBER_SEPARATOR}'");
    }
    Ok(())
}
