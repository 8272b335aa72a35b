pub(crate) mod support;

mod ring_tests;
