mod core_tests;
mod helpers;
mod recovery_tests;
