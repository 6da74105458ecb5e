use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_warehouse_items_table::Migration),
            Box::new(m20250101_000002_create_wallet_tables::Migration),
            Box::new(m20250101_000003_create_order_tables::Migration),
            Box::new(m20250101_000004_create_payment_queue_table::Migration),
            Box::new(m20250301_000005_create_withdraw_and_deposit_tables::Migration),
        ]
    }
}

mod m20250101_000001_create_warehouse_items_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_warehouse_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(WarehouseItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WarehouseItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WarehouseItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(WarehouseItems::ShopId).uuid().not_null())
                        .col(ColumnDef::new(WarehouseItems::StallId).uuid().not_null())
                        .col(ColumnDef::new(WarehouseItems::SellerId).uuid().not_null())
                        .col(ColumnDef::new(WarehouseItems::ItemType).string().not_null())
                        .col(ColumnDef::new(WarehouseItems::Payload).text().not_null())
                        .col(
                            ColumnDef::new(WarehouseItems::Locked)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(WarehouseItems::LockedBy).uuid().null())
                        .col(
                            ColumnDef::new(WarehouseItems::LockedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(WarehouseItems::ReservedUntil)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(WarehouseItems::SoldAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(WarehouseItems::IsDeleted)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(WarehouseItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WarehouseItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Serves the FIFO claim query
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_warehouse_items_claim")
                        .table(WarehouseItems::Table)
                        .col(WarehouseItems::ProductId)
                        .col(WarehouseItems::Locked)
                        .col(WarehouseItems::IsDeleted)
                        .col(WarehouseItems::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_warehouse_items_reserved_until")
                        .table(WarehouseItems::Table)
                        .col(WarehouseItems::Locked)
                        .col(WarehouseItems::ReservedUntil)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_warehouse_items_locked_by")
                        .table(WarehouseItems::Table)
                        .col(WarehouseItems::LockedBy)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WarehouseItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum WarehouseItems {
        Table,
        Id,
        ProductId,
        ShopId,
        StallId,
        SellerId,
        ItemType,
        Payload,
        Locked,
        LockedBy,
        LockedAt,
        ReservedUntil,
        SoldAt,
        IsDeleted,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000002_create_wallet_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_wallet_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Wallets::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Wallets::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Wallets::UserId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(Wallets::Balance)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Wallets::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Wallets::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(WalletHolds::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WalletHolds::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WalletHolds::WalletId).uuid().not_null())
                        .col(ColumnDef::new(WalletHolds::UserId).uuid().not_null())
                        .col(ColumnDef::new(WalletHolds::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(WalletHolds::Amount)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WalletHolds::Status).string().not_null())
                        .col(
                            ColumnDef::new(WalletHolds::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WalletHolds::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WalletHolds::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_wallet_holds_order_id")
                        .table(WalletHolds::Table)
                        .col(WalletHolds::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_wallet_holds_status_expires_at")
                        .table(WalletHolds::Table)
                        .col(WalletHolds::Status)
                        .col(WalletHolds::ExpiresAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(WalletHistories::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WalletHistories::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WalletHistories::WalletId).uuid().not_null())
                        .col(
                            ColumnDef::new(WalletHistories::EntryType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WalletHistories::Status).string().not_null())
                        .col(
                            ColumnDef::new(WalletHistories::ReferenceId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WalletHistories::Amount)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WalletHistories::BalanceAfter)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WalletHistories::Description).string().null())
                        .col(
                            ColumnDef::new(WalletHistories::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One entry per (wallet, reference, type) makes credits idempotent
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_wallet_histories_reference")
                        .table(WalletHistories::Table)
                        .col(WalletHistories::WalletId)
                        .col(WalletHistories::ReferenceId)
                        .col(WalletHistories::EntryType)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WalletHistories::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(WalletHolds::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Wallets::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Wallets {
        Table,
        Id,
        UserId,
        Balance,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum WalletHolds {
        Table,
        Id,
        WalletId,
        UserId,
        OrderId,
        Amount,
        Status,
        ExpiresAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum WalletHistories {
        Table,
        Id,
        WalletId,
        EntryType,
        Status,
        ReferenceId,
        Amount,
        BalanceAfter,
        Description,
        CreatedAt,
    }
}

mod m20250101_000003_create_order_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Orders::OrderCode)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::BuyerId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Status).string().not_null())
                        .col(ColumnDef::new(Orders::SettlementState).string().not_null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string().not_null())
                        .col(
                            ColumnDef::new(Orders::TotalAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalCommission)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::TotalSellerAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::PaymentReference).string().null())
                        .col(ColumnDef::new(Orders::AbortReason).string().null())
                        .col(
                            ColumnDef::new(Orders::ReservedUntil)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_buyer_id")
                        .table(Orders::Table)
                        .col(Orders::BuyerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_settlement_state")
                        .table(Orders::Table)
                        .col(Orders::SettlementState)
                        .col(Orders::ReservedUntil)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(OrderItems::WarehouseItemId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::SellerId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ShopId).uuid().not_null())
                        .col(
                            ColumnDef::new(OrderItems::Quantity)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(OrderItems::UnitPrice)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::TotalAmount)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CommissionRate)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CommissionAmount)
                                .decimal()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::SellerAmount)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::Status).string().not_null())
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_warehouse_item_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::WarehouseItemId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        OrderCode,
        BuyerId,
        Status,
        SettlementState,
        PaymentMethod,
        TotalAmount,
        TotalCommission,
        TotalSellerAmount,
        PaymentReference,
        AbortReason,
        ReservedUntil,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        WarehouseItemId,
        SellerId,
        ShopId,
        Quantity,
        UnitPrice,
        TotalAmount,
        CommissionRate,
        CommissionAmount,
        SellerAmount,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000004_create_payment_queue_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_payment_queue_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentQueue::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentQueue::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentQueue::OrderId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PaymentQueue::UserId).uuid().not_null())
                        .col(
                            ColumnDef::new(PaymentQueue::Amount)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentQueue::Status).string().not_null())
                        .col(ColumnDef::new(PaymentQueue::ErrorMessage).string().null())
                        .col(
                            ColumnDef::new(PaymentQueue::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentQueue::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_queue_status_created_at")
                        .table(PaymentQueue::Table)
                        .col(PaymentQueue::Status)
                        .col(PaymentQueue::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentQueue::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentQueue {
        Table,
        Id,
        OrderId,
        UserId,
        Amount,
        Status,
        ErrorMessage,
        CreatedAt,
        ProcessedAt,
    }
}

mod m20250301_000005_create_withdraw_and_deposit_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000005_create_withdraw_and_deposit_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(WithdrawRequests::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WithdrawRequests::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WithdrawRequests::UserId).uuid().not_null())
                        .col(
                            ColumnDef::new(WithdrawRequests::Amount)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WithdrawRequests::Status).string().not_null())
                        .col(
                            ColumnDef::new(WithdrawRequests::BankAccountNumber)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WithdrawRequests::BankAccountName)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WithdrawRequests::BankName).string().not_null())
                        .col(ColumnDef::new(WithdrawRequests::Note).string().null())
                        .col(ColumnDef::new(WithdrawRequests::ReviewedBy).uuid().null())
                        .col(
                            ColumnDef::new(WithdrawRequests::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WithdrawRequests::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_withdraw_requests_user_status")
                        .table(WithdrawRequests::Table)
                        .col(WithdrawRequests::UserId)
                        .col(WithdrawRequests::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(WalletDeposits::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WalletDeposits::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WalletDeposits::Code)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(WalletDeposits::UserId).uuid().not_null())
                        .col(ColumnDef::new(WalletDeposits::Amount).decimal().not_null())
                        .col(ColumnDef::new(WalletDeposits::Status).string().not_null())
                        .col(ColumnDef::new(WalletDeposits::ProviderTxn).string().null())
                        .col(ColumnDef::new(WalletDeposits::ResponseCode).string().null())
                        .col(
                            ColumnDef::new(WalletDeposits::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(WalletDeposits::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WalletDeposits::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(WithdrawRequests::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum WithdrawRequests {
        Table,
        Id,
        UserId,
        Amount,
        Status,
        BankAccountNumber,
        BankAccountName,
        BankName,
        Note,
        ReviewedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum WalletDeposits {
        Table,
        Id,
        Code,
        UserId,
        Amount,
        Status,
        ProviderTxn,
        ResponseCode,
        CreatedAt,
        UpdatedAt,
    }
}
