mod helpers;

mod tests_recovery;
mod tests_snapshots;
