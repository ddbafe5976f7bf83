use std::env;

fn main() -> Result<(), anyhow::Error> {
	if env::var_os("PROTOC").is_none() {
		env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
	}

	let proto_file = std::env::current_dir().unwrap().join("proto/sharelock.proto");
	let include_dir = std::env::current_dir().unwrap().join("proto");

	let out_dir = env::var("OUT_DIR").unwrap();
	let descriptor_path = std::path::PathBuf::from(out_dir).join("sharelock_descriptor.bin");

	tonic_build::configure()
		.build_server(true)
		.build_client(false)
		.file_descriptor_set_path(&descriptor_path)
		.compile_protos(&[proto_file.to_str().unwrap()], &[include_dir.to_str().unwrap()])?;

	println!("cargo:rerun-if-changed={}", proto_file.to_str().unwrap());
	Ok(())
}
