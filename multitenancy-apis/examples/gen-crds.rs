use kube::CustomResourceExt;
use multitenancy_apis::{Tenant, TenantResource};

pub fn main() {
    println!("{}", serde_yaml::to_string(&Tenant::crd()).unwrap());
    println!("---");
    println!("{}", serde_yaml::to_string(&TenantResource::crd()).unwrap());
}
