pub mod locator;
pub mod registrar;
pub mod server;

pub use locator::{ContactBinding, Locator, MemoryLocator};
pub use registrar::{Registrar, RegistrarOption};
pub use server::{DomainRule, ForwardingRule, ProxyOption, ProxyServer};
