#[cfg(test)]
mod controller_tests;
#[cfg(test)]
mod ddr_tests;
