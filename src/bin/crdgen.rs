use cassandra_k8s::crd::CassandraCluster;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&CassandraCluster::crd())?);
    Ok(())
}
