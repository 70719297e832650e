pub mod gtsdb_dataset_loader;
