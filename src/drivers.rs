pub mod i2c_ec;
