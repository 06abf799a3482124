use rand::Rng;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Characters sandbox and job ids are drawn from. Lowercase so ids are valid DNS labels.
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of a sandbox id.
pub const SANDBOX_ID_LEN: usize = 12;

/// Length of a spawn job id.
pub const JOB_ID_LEN: usize = 8;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a random id of `len` characters from `[a-z0-9]`.
pub fn generate_id(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Generates a new sandbox id.
pub fn generate_sandbox_id() -> String {
    generate_id(SANDBOX_ID_LEN)
}

/// Generates a new spawn job id.
pub fn generate_job_id() -> String {
    generate_id(JOB_ID_LEN)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
