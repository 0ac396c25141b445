use simrpc_core::{
    descriptor::resolve_from_files,
    prost_reflect::DescriptorPool,
    reflection::client::{ReflectionClient, ReflectionResolveError},
};
use support::protos;
use tonic::Code;
use tonic_reflection::server::v1::{ServerReflection, ServerReflectionServer};

mod support;

fn setup_reflection_client() -> ReflectionClient<ServerReflectionServer<impl ServerReflection>> {
    let services = resolve_from_files(&protos(&["inventory.proto", "echo.proto"]))
        .expect("Failed to resolve protos");

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_file_descriptor_set(services.file_descriptor_set())
        .include_reflection_service(false)
        .build_v1()
        .expect("Failed to setup Reflection Service");

    ReflectionClient::new(reflection_service)
}

#[tokio::test]
async fn test_list_services() {
    let mut client = setup_reflection_client();

    let mut services = client.list_services().await.unwrap();
    services.sort();

    assert_eq!(
        services,
        [
            "grpc.examples.echo.Echo",
            "inventory.Catalog",
            "inventory.Warehouse"
        ]
    );
}

#[tokio::test]
async fn test_symbols_resolve_with_their_imports_once() {
    let mut client = setup_reflection_client();

    let fd_set = client
        .file_descriptor_set_by_symbols(&[
            "inventory.Warehouse".to_string(),
            "inventory.Catalog".to_string(),
        ])
        .await
        .expect("Failed to fetch file descriptor set");

    let mut files: Vec<_> = fd_set
        .file
        .iter()
        .filter_map(|f| f.name.clone())
        .collect();
    files.sort();
    assert_eq!(files, ["common/money.proto", "inventory.proto"]);

    let pool = DescriptorPool::from_file_descriptor_set(fd_set).unwrap();
    let item = pool.get_message_by_name("inventory.Item").unwrap();
    assert_eq!(
        item.get_field_by_name("price").unwrap().kind().as_message().unwrap().full_name(),
        "common.Money"
    );
}

#[tokio::test]
async fn test_no_symbols_resolve_to_an_empty_set() {
    let mut client = setup_reflection_client();

    let fd_set = client.file_descriptor_set_by_symbols(&[]).await.unwrap();
    assert!(fd_set.file.is_empty());
}

#[tokio::test]
async fn test_unknown_symbol_is_a_stream_failure() {
    let mut client = setup_reflection_client();

    let result = client
        .file_descriptor_set_by_symbol("non.existent.Service")
        .await;

    assert!(matches!(
        result,
        Err(ReflectionResolveError::ServerStreamFailure(status)) if status.code() == Code::NotFound
    ));
}
