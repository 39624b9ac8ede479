//! Fixtures shared by the integration tests: a simulated bus, an SDO client, and the object
//! dictionary of the node under test
pub mod mem_storage;
pub mod object_dict;
pub mod sdo_client;
pub mod sim_bus;
