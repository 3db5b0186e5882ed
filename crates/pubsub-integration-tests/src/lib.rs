//! End-to-end tests for `pubsub-runtime` live under `tests/`.
