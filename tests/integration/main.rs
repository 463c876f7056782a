//! Integration tests.

mod full_loop;
mod mock_wallet;
