mod helpers;


// Priority 3 — hardening (byte-level corruption)
mod tests_corruption;
