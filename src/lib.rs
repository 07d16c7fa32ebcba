pub mod cli;
pub mod datastore;
pub mod nacm;
pub mod netconf;
pub mod protocol;
pub mod xml;

pub use cli::{Command, prompt};
pub use nacm::{AuthzRequest, Decision, Nacm, NacmMode};
pub use xml::{XmlError, XmlNode};
