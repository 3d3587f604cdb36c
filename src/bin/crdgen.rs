use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crd = kappital_engine::resources::ServicePackage::crd();
    println!("---");
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
